use ndarray::{Array3, Ix3, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpzError};
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// 打开 `NpzArchive` 错误.
#[derive(Debug)]
pub enum OpenArchiveError {
    /// workers 太大. 最多支持 64.
    TooManyWorkers(u32),

    /// 打开 npz 文件错误.
    ReadNpzError(ReadNpzError),

    /// 其他底层 I/O 错误.
    IoError(std::io::Error),
}

/// Npz 文件归档.
///
/// 该结构可用于建模硬盘上已存储的多个 3D 体数据的压缩文件,
/// 例如离线推理产出的概率图栈或其对应的实例标签栈.
pub struct NpzArchive {
    entries: Vec<Mutex<NpzReader<File>>>,
    turn: AtomicUsize,
}

impl NpzArchive {
    /// 初始化.
    ///
    /// `workers` 指定了底层工作通道的个数, 最大为 64. 系统会从路径 `p` 打开文件
    /// `workers` 次, 并为每个打开通道指定一个排他入口点 (以期获得更高的并行度).
    pub fn new<P: AsRef<Path>>(workers: NonZeroUsize, p: P) -> Result<Self, OpenArchiveError> {
        let workers = workers.get();
        if workers > 64 {
            return Err(OpenArchiveError::TooManyWorkers(64));
        }
        let mut v = Vec::with_capacity(workers);
        for _ in 0..workers {
            let file = OpenOptions::new()
                .read(true)
                .open(p.as_ref())
                .map_err(OpenArchiveError::IoError)?;
            v.push(Mutex::new(
                NpzReader::new(file).map_err(OpenArchiveError::ReadNpzError)?,
            ));
        }
        Ok(Self {
            entries: v,
            turn: AtomicUsize::new(0),
        })
    }

    /// 通过 npz 索引文件名 `name` 获取底层 3D 实例标签体内容.
    pub fn label_by_name(&self, name: &str) -> Result<Array3<u32>, ReadNpzError> {
        let slot = self.next_slot();
        let mut file = self.entries[slot].lock().unwrap();
        file.by_name::<OwnedRepr<u32>, Ix3>(name)
    }

    /// 通过 npz 索引文件名 `name` 获取底层 3D 概率体内容.
    pub fn prob_by_name(&self, name: &str) -> Result<Array3<f32>, ReadNpzError> {
        let slot = self.next_slot();
        let mut file = self.entries[slot].lock().unwrap();
        file.by_name::<OwnedRepr<f32>, Ix3>(name)
    }

    /// 通过文件名 `{num}.npy` 获取底层 3D 实例标签体内容.
    pub fn label_by_num_dot_npy(&self, num: u32) -> Result<Array3<u32>, ReadNpzError> {
        let filename = format!("{num}.npy");
        self.label_by_name(filename.as_str())
    }

    /// 获取底层 npz 文件包含的所有文件名.
    pub fn entry_names(&self) -> Result<Vec<String>, ReadNpzError> {
        let slot = self.next_slot();
        self.entries[slot].lock().unwrap().names()
    }

    /// 工作通道个数.
    #[inline]
    pub fn worker_len(&self) -> usize {
        self.entries.len()
    }

    /// 获取底层 npz 文件的条目个数.
    pub fn entry_len(&self) -> usize {
        let slot = self.next_slot();
        self.entries[slot].lock().unwrap().len()
    }

    fn next_slot(&self) -> usize {
        self.turn.fetch_add(1, Ordering::Relaxed) % self.worker_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use ndarray_npy::NpzWriter;

    fn temp_archive(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(name);

        let mut writer = NpzWriter::new(File::create(&path).unwrap());
        let labels = Array3::<u32>::from_shape_fn((2, 3, 3), |(z, h, w)| (z + h + w) as u32);
        let prob = Array3::<f32>::from_elem((2, 3, 3), 0.5);
        writer.add_array("0.npy", &labels).unwrap();
        writer.add_array("prob-0.npy", &prob).unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_archive_roundtrip() {
        let path = temp_archive("vox_berry_npz_roundtrip.npz");
        let archive = NpzArchive::new(NonZeroUsize::new(2).unwrap(), &path).unwrap();

        assert_eq!(archive.worker_len(), 2);
        assert_eq!(archive.entry_len(), 2);

        let labels = archive.label_by_num_dot_npy(0).unwrap();
        assert_eq!(labels.dim(), (2, 3, 3));
        assert_eq!(labels[(1, 2, 2)], 5);

        let prob = archive.prob_by_name("prob-0.npy").unwrap();
        assert_eq!(prob[(0, 0, 0)], 0.5);

        let mut names = archive.entry_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["0.npy", "prob-0.npy"]);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_too_many_workers() {
        let path = temp_archive("vox_berry_npz_workers.npz");
        let r = NpzArchive::new(NonZeroUsize::new(65).unwrap(), &path);
        assert!(matches!(r, Err(OpenArchiveError::TooManyWorkers(64))));
        let _ = std::fs::remove_file(path);
    }
}

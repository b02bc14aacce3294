//! 数据集操作.
//!
//! 体数据集按目录组织: 一个目录存放编号的标量体 (原始强度或概率),
//! 另一个目录存放同编号的实例标签体. 加载器是迭代器风格的,
//! 体数据在被消费时才真正读入内存.

use std::path::{Path, PathBuf};

pub mod generic;
mod npz_database;

pub use npz_database::{NpzArchive, OpenArchiveError};

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    ans.extend(it);
    Some(ans)
}

/// 编号标量体的默认文件名: `volume-{index}.nii`.
#[inline]
pub fn scalar_filename(index: u32) -> String {
    format!("volume-{index}.nii")
}

/// 编号标签体的默认文件名: `instances-{index}.nii`.
#[inline]
pub fn label_filename(index: u32) -> String {
    format!("instances-{index}.nii")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filenames() {
        assert_eq!(scalar_filename(7), "volume-7.nii");
        assert_eq!(label_filename(7), "instances-7.nii");
    }

    #[test]
    fn test_home_dataset_dir_with() {
        if let Some(p) = home_dataset_dir_with(["pred", "prob"]) {
            assert!(p.ends_with("dataset/pred/prob"));
        }
    }
}

//! 通用体数据集加载器.
//!
//! 提供迭代器风格的数据集获取模式.

use crate::{LabelVolume, ScalarVolume, VolumePair};
use std::path::{Path, PathBuf};

/// 文件名构造器. 接受数据集索引数, 获得文件名.
pub type FilenameBuilder = fn(u32) -> String;

/// 从指定索引、路径、文件名构造器来创建通用的标量体加载器.
///
/// # 注意
///
/// 1. `path` 必须是目录, 否则程序 panic.
/// 2. `data` 的所有取值 `value` 必须在 `path` 下有形如 `builder(value)`
///   的 nifti 文件, 否则加载器在迭代时会返回 `Result::Error`.
pub fn scalar_loader<I: IntoIterator<Item = u32>, P: AsRef<Path>>(
    data: I,
    path: P,
    builder: FilenameBuilder,
) -> ScalarLoader {
    let path = path.as_ref().to_owned();
    assert!(path.is_dir());

    let mut data: Vec<u32> = data.into_iter().collect();
    data.reverse();

    ScalarLoader {
        path,
        data_rev: data,
        builder,
    }
}

/// 3D 标量体加载器, 并在内部自动转换文件名.
#[derive(Debug)]
pub struct ScalarLoader {
    path: PathBuf,
    data_rev: Vec<u32>,
    builder: FilenameBuilder,
}

impl Iterator for ScalarLoader {
    type Item = (u32, nifti::Result<ScalarVolume>);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.data_rev.pop()?;

        self.path.push((self.builder)(idx));
        let data = ScalarVolume::open(self.path.as_path());
        self.path.pop();

        Some((idx, data))
    }
}

impl ExactSizeIterator for ScalarLoader {
    #[inline]
    fn len(&self) -> usize {
        self.data_rev.len()
    }
}

/// 从指定索引、路径、文件名构造器来创建通用的标签体加载器.
///
/// # 注意
///
/// 1. `path` 必须是目录, 否则程序 panic.
/// 2. `data` 的所有取值 `value` 必须在 `path` 下有形如 `builder(value)`
///   的 nifti 文件, 否则加载器在迭代时会返回 `Result::Error`.
pub fn label_loader<I: IntoIterator<Item = u32>, P: AsRef<Path>>(
    data: I,
    path: P,
    builder: FilenameBuilder,
) -> LabelLoader {
    let path = path.as_ref().to_owned();
    assert!(path.is_dir());

    let mut data: Vec<u32> = data.into_iter().collect();
    data.reverse();

    LabelLoader {
        path,
        data_rev: data,
        builder,
    }
}

/// 3D 标签体加载器, 并在内部自动转换文件名.
#[derive(Debug)]
pub struct LabelLoader {
    path: PathBuf,
    data_rev: Vec<u32>,
    builder: FilenameBuilder,
}

impl Iterator for LabelLoader {
    type Item = (u32, nifti::Result<LabelVolume>);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.data_rev.pop()?;

        self.path.push((self.builder)(idx));
        let data = LabelVolume::open(self.path.as_path());
        self.path.pop();

        Some((idx, data))
    }
}

impl ExactSizeIterator for LabelLoader {
    #[inline]
    fn len(&self) -> usize {
        self.data_rev.len()
    }
}

/// 从指定索引、路径、文件名构造器来创建通用的 (标量, 标签) 对加载器.
///
/// # 注意
///
/// 1. `scalar_path` 和 `label_path` 必须是目录, 否则程序 panic.
/// 2. `data` 的所有取值 `value` 必须分别在两个目录下有形如
///   `scalar_builder(value)` / `label_builder(value)` 的 nifti 文件,
///   否则加载器在迭代时会返回 `Result::Error`.
pub fn pair_loader<I: IntoIterator<Item = u32>, P: AsRef<Path>>(
    data: I,
    scalar_path: P,
    scalar_builder: FilenameBuilder,
    label_path: P,
    label_builder: FilenameBuilder,
) -> PairLoader {
    let scalar_path = scalar_path.as_ref().to_owned();
    let label_path = label_path.as_ref().to_owned();
    assert!(scalar_path.is_dir());
    assert!(label_path.is_dir());

    let mut data: Vec<u32> = data.into_iter().collect();
    data.reverse();

    PairLoader {
        scalar_path,
        scalar_builder,
        label_path,
        label_builder,
        data_rev: data,
    }
}

/// 3D (标量, 标签) 数据集加载器, 并在内部自动转换文件名.
#[derive(Debug)]
pub struct PairLoader {
    scalar_path: PathBuf,
    scalar_builder: FilenameBuilder,
    label_path: PathBuf,
    label_builder: FilenameBuilder,
    data_rev: Vec<u32>,
}

impl Iterator for PairLoader {
    type Item = (u32, nifti::Result<VolumePair>);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.data_rev.pop()?;

        self.scalar_path.push((self.scalar_builder)(idx));
        self.label_path.push((self.label_builder)(idx));
        let data = VolumePair::open(&self.scalar_path, &self.label_path);
        self.label_path.pop();
        self.scalar_path.pop();

        Some((idx, data))
    }
}

impl ExactSizeIterator for PairLoader {
    #[inline]
    fn len(&self) -> usize {
        self.data_rev.len()
    }
}

//! 对 `vox_berry::dataset` 的更一层封装. 提供更直接的数据集加载器.

use std::env;
use std::path::{Path, PathBuf};

use vox_berry::dataset::generic::{self, ScalarLoader};
use vox_berry::dataset::scalar_filename;
use vox_berry::{Idx3d, ScalarVolume};

/// 获取概率体数据集基本路径.
///
/// 1. 若环境变量 `$VOX_PROB_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/prob`.
pub fn prob_dir_from_env_or_home() -> PathBuf {
    if let Ok(d) = env::var("VOX_PROB_DIR") {
        PathBuf::from(d)
    } else {
        vox_berry::dataset::home_dataset_dir_with(["prob"]).unwrap()
    }
}

/// 获取概率体数据加载器. 按编号依次加载 `path` 下前 `count` 个
/// `volume-{i}.nii` 文件.
pub fn prob_loader<P: AsRef<Path>>(path: P, count: u32) -> ScalarLoader {
    generic::scalar_loader(0..count, path, scalar_filename)
}

/// 加载至多 `count` 个概率体. 数据集目录不存在 (或其中没有可读体积)
/// 时回退到确定性的合成体积.
pub fn prob_volumes_or_synthetic(count: u32) -> Vec<ScalarVolume> {
    let dir = prob_dir_from_env_or_home();
    if dir.is_dir() {
        let loaded: Vec<ScalarVolume> = prob_loader(&dir, count)
            .filter_map(|(_, r)| r.ok())
            .collect();
        if !loaded.is_empty() {
            return loaded;
        }
    }
    (0..count).map(synthetic_prob_volume).collect()
}

/// 确定性地合成一个概率体: 在 24^3 体积内摆放若干锥形概率峰.
///
/// `index` 只改变峰的摆放相位, 同一 `index` 的结果可复现.
pub fn synthetic_prob_volume(index: u32) -> ScalarVolume {
    const SIDE: usize = 24;
    const PEAKS: [Idx3d; 3] = [(6, 6, 6), (12, 16, 8), (17, 9, 17)];

    let phase = (index as usize) % 4;
    let mut data = ndarray::Array3::<f32>::zeros((SIDE, SIDE, SIDE));
    for (pos, v) in data.indexed_iter_mut() {
        let mut best = 0.0f32;
        for &(pz, ph, pw) in &PEAKS {
            let center = (pz, (ph + phase) % SIDE, pw);
            let d = chebyshev(pos, center);
            // 峰值 0.95, 每离开一格衰减 0.18.
            let p = 0.95 - 0.18 * d as f32;
            best = best.max(p);
        }
        *v = best.max(0.0);
    }
    ScalarVolume::from_array(data, [1.0; 3])
}

/// 切比雪夫距离.
#[inline]
fn chebyshev(a: Idx3d, b: Idx3d) -> usize {
    a.0.abs_diff(b.0)
        .max(a.1.abs_diff(b.1))
        .max(a.2.abs_diff(b.2))
}

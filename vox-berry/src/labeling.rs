//! 概率体二值化与连通域实例标注.
//!
//! 标注是一次性的全局单遍变换, 不在内部并行, 以换取正确性上的简单:
//! 体素按栅格序扫描, 每遇到一个未标注前景体素就从它出发做一次 BFS
//! 洪泛填充. 因此实例 id 的分配顺序是确定的 (最先遇到的连通域得到
//! 最小的 id), 对同一参数重复标注得到的划分同构.

use std::collections::VecDeque;

use log::debug;
use ndarray::Array3;
use once_cell::sync::Lazy;

use crate::consts::label::*;
use crate::consts::ElemType;
use crate::data::{LabelVolume, ScalarVolume, VolumeMetaAttr};
use crate::error::ThresholdError;
use crate::Idx3d;

/// 6-邻域 (面相邻) 偏移.
const OFFSETS_6: [[i64; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

/// 18-邻域 (面 + 棱相邻) 偏移.
static OFFSETS_18: Lazy<Vec<[i64; 3]>> = Lazy::new(|| build_offsets(2));

/// 26-邻域 (面 + 棱 + 角相邻) 偏移.
static OFFSETS_26: Lazy<Vec<[i64; 3]>> = Lazy::new(|| build_offsets(3));

/// 生成曼哈顿距离不超过 `max_manhattan` 的全部单位立方邻域偏移.
fn build_offsets(max_manhattan: i64) -> Vec<[i64; 3]> {
    let mut out = Vec::with_capacity(26);
    for dz in -1i64..=1 {
        for dh in -1i64..=1 {
            for dw in -1i64..=1 {
                if (dz, dh, dw) == (0, 0, 0) {
                    continue;
                }
                if dz.abs() + dh.abs() + dw.abs() <= max_manhattan {
                    out.push([dz, dh, dw]);
                }
            }
        }
    }
    out
}

/// 3D 邻域连通性.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Connectivity {
    /// 6-邻域: 仅面相邻.
    Six,

    /// 18-邻域: 面和棱相邻.
    Eighteen,

    /// 26-邻域: 面, 棱和角相邻.
    TwentySix,
}

impl Connectivity {
    /// 邻域偏移表.
    #[inline]
    pub(crate) fn offsets(&self) -> &'static [[i64; 3]] {
        match self {
            Self::Six => &OFFSETS_6,
            Self::Eighteen => &OFFSETS_18,
            Self::TwentySix => &OFFSETS_26,
        }
    }

    /// 邻居个数.
    #[inline]
    pub fn degree(&self) -> usize {
        self.offsets().len()
    }
}

/// `pos + offset`, 带边界检查. 越界时返回 `None`.
#[inline]
pub(crate) fn offset_pos(
    (z, h, w): Idx3d,
    [dz, dh, dw]: [i64; 3],
    (sz, sh, sw): Idx3d,
) -> Option<Idx3d> {
    let z = z.checked_add_signed(dz as isize)?;
    let h = h.checked_add_signed(dh as isize)?;
    let w = w.checked_add_signed(dw as isize)?;
    (z < sz && h < sh && w < sw).then_some((z, h, w))
}

/// 标注参数.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelParams {
    /// 二值化阈值. `>=` 为前景.
    pub threshold: f32,

    /// 连通性.
    pub connectivity: Connectivity,

    /// 小于该体素数的连通域视为噪声, 归为背景.
    pub min_voxels: usize,
}

/// 二值化并做连通域标注.
///
/// 实例 id 从 [`FIRST_INSTANCE`] 开始, 按栅格序首次遇到的顺序分配.
/// 过滤掉小于 `min_voxels` 的连通域后重新压缩编号, 保证存活实例的
/// id 连续. 返回标签体和存活实例个数.
///
/// # 错误
///
/// `threshold` 不在概率体的有限值域内时返回 [`ThresholdError`].
pub fn label_components(
    prob: &ScalarVolume,
    params: &LabelParams,
) -> Result<(LabelVolume, u32), ThresholdError> {
    let (lo, hi) = prob.value_range().unwrap_or((0.0, 0.0));
    if !(lo..=hi).contains(&params.threshold) {
        return Err(ThresholdError {
            threshold: params.threshold,
            lo,
            hi,
        });
    }

    let shape = prob.shape();
    let data = prob.data();
    let offsets = params.connectivity.offsets();
    let foreground =
        |v: f32| ElemType::from_prob(v, params.threshold).is_foreground();

    let mut out = Array3::<u32>::zeros(shape);
    let mut sizes: Vec<usize> = Vec::new();
    let mut queue = VecDeque::with_capacity(64);

    for (pos, &v) in data.indexed_iter() {
        if !foreground(v) || is_instance(out[pos]) {
            continue;
        }

        // 新连通域: 从 `pos` 出发洪泛填充.
        let id = FIRST_INSTANCE + sizes.len() as u32;
        let mut voxels = 0usize;
        out[pos] = id;
        queue.push_back(pos);

        while let Some(cur) = queue.pop_front() {
            voxels += 1;
            for &off in offsets {
                let Some(next) = offset_pos(cur, off, shape) else {
                    continue;
                };
                if foreground(data[next]) && is_background(out[next]) {
                    out[next] = id;
                    queue.push_back(next);
                }
            }
        }
        sizes.push(voxels);
    }

    // 小连通域归为背景, 存活者按原顺序压缩编号.
    let mut remap = vec![BACKGROUND; sizes.len() + 1];
    let mut survivors = 0u32;
    for (i, &size) in sizes.iter().enumerate() {
        if size >= params.min_voxels {
            survivors += 1;
            remap[i + 1] = survivors;
        }
    }
    out.mapv_inplace(|v| remap[v as usize]);

    debug!(
        "连通域标注: {} 个候选, {survivors} 个存活 (min_voxels = {})",
        sizes.len(),
        params.min_voxels
    );
    Ok((
        LabelVolume::from_parts(prob.meta().clone(), out),
        survivors,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn params(connectivity: Connectivity) -> LabelParams {
        LabelParams {
            threshold: 0.5,
            connectivity,
            min_voxels: 1,
        }
    }

    fn volume_with(foreground: &[Idx3d], shape: Idx3d) -> ScalarVolume {
        let mut data = Array3::zeros(shape);
        for &pos in foreground {
            data[pos] = 1.0;
        }
        ScalarVolume::from_array(data, [1.0; 3])
    }

    #[test]
    fn test_diagonal_connectivity() {
        // 两个仅以体对角相连的体素.
        let vol = volume_with(&[(0, 0, 0), (1, 1, 1)], (2, 2, 2));

        let (labels, n) = label_components(&vol, &params(Connectivity::TwentySix)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(labels[(0, 0, 0)], labels[(1, 1, 1)]);

        let (labels, n) = label_components(&vol, &params(Connectivity::Six)).unwrap();
        assert_eq!(n, 2);
        assert_ne!(labels[(0, 0, 0)], labels[(1, 1, 1)]);

        // 棱相邻: 18-邻域连通, 6-邻域不连通.
        let vol = volume_with(&[(0, 0, 0), (0, 1, 1)], (1, 2, 2));
        let (_, n) = label_components(&vol, &params(Connectivity::Eighteen)).unwrap();
        assert_eq!(n, 1);
        let (_, n) = label_components(&vol, &params(Connectivity::Six)).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_deterministic_id_order() {
        // 栅格序最先遇到的连通域获得最小 id.
        let vol = volume_with(&[(0, 0, 3), (1, 1, 0)], (2, 2, 4));
        let (labels, n) = label_components(&vol, &params(Connectivity::Six)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(labels[(0, 0, 3)], 1);
        assert_eq!(labels[(1, 1, 0)], 2);
    }

    #[test]
    fn test_min_voxels_filter_compacts_ids() {
        // 一个 1 体素的小岛和一个 3 体素的条带.
        let vol = volume_with(&[(0, 0, 0), (0, 2, 0), (0, 2, 1), (0, 2, 2)], (1, 3, 3));
        let p = LabelParams {
            threshold: 0.5,
            connectivity: Connectivity::Six,
            min_voxels: 2,
        };
        let (labels, n) = label_components(&vol, &p).unwrap();
        assert_eq!(n, 1);
        assert_eq!(labels[(0, 0, 0)], 0);
        assert_eq!(labels[(0, 2, 0)], 1);
        assert_eq!(labels[(0, 2, 2)], 1);
    }

    #[test]
    fn test_idempotent_partition() {
        let vol = volume_with(
            &[(0, 0, 0), (0, 0, 1), (2, 3, 3), (2, 3, 2), (1, 2, 0)],
            (3, 4, 4),
        );
        let p = params(Connectivity::Six);
        let (first, n1) = label_components(&vol, &p).unwrap();

        // 把标注结果当作概率体再标注一遍, 划分应当同构.
        let as_prob = ScalarVolume::from_parts(
            first.meta().clone(),
            first.data().mapv(|v| if v > 0 { 1.0 } else { 0.0 }),
        );
        let (second, n2) = label_components(&as_prob, &p).unwrap();
        assert_eq!(n1, n2);
        assert!(first
            .data()
            .iter()
            .zip(second.data().iter())
            .all(|(a, b)| (*a == 0) == (*b == 0)));
        // 这里划分甚至逐体素相等, 因为扫描顺序一致.
        assert_eq!(first.data(), second.data());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let vol = ScalarVolume::from_array(array![[[0.2f32, 0.4]]], [1.0; 3]);
        let err = label_components(
            &vol,
            &LabelParams {
                threshold: 0.9,
                connectivity: Connectivity::Six,
                min_voxels: 1,
            },
        )
        .unwrap_err();
        assert_eq!(err.lo, 0.2);
        assert_eq!(err.hi, 0.4);
    }

    #[test]
    fn test_connectivity_degree() {
        assert_eq!(Connectivity::Six.degree(), 6);
        assert_eq!(Connectivity::Eighteen.degree(), 18);
        assert_eq!(Connectivity::TwentySix.degree(), 26);
    }
}

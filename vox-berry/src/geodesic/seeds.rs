//! 实例内部种子体素检测 (局部概率极大值).

use ndarray::ArrayView3;
use ordered_float::NotNan;

use crate::labeling::{offset_pos, Connectivity};
use crate::Idx3d;

/// 两体素中心物理距离的平方, 单位 (mm)^2.
#[inline]
pub(crate) fn phys_dist2(a: Idx3d, b: Idx3d, spacing: [f64; 3]) -> f64 {
    let dz = a.0.abs_diff(b.0) as f64 * spacing[0];
    let dh = a.1.abs_diff(b.1) as f64 * spacing[1];
    let dw = a.2.abs_diff(b.2) as f64 * spacing[2];
    dz * dz + dh * dh + dw * dw
}

/// 在 `inside` 界定的区域内寻找种子体素.
///
/// 候选是 26-邻域内 (限制在区域内部) 的局部极大值: 概率不小于所有
/// 邻居, 且严格大于至少一个邻居. 后一个条件把完全平坦的高原排除在外,
/// 均匀概率的实例因此不会产生种子.
///
/// 候选按概率降序排序 (平手时低栅格序优先) 后做最小间隔筛选:
/// 与已选种子的欧氏距离小于 `min_sep_mm` 的候选被丢弃.
/// 整个过程是确定的.
pub(crate) fn find_seeds<F>(
    prob: ArrayView3<'_, f32>,
    spacing: [f64; 3],
    min_sep_mm: f64,
    inside: F,
) -> Vec<Idx3d>
where
    F: Fn(Idx3d) -> bool,
{
    let shape = prob.dim();
    let offsets = Connectivity::TwentySix.offsets();

    let mut candidates: Vec<(NotNan<f32>, Idx3d)> = Vec::new();
    for (pos, &v) in prob.indexed_iter() {
        if !inside(pos) {
            continue;
        }
        let Ok(v) = NotNan::new(v) else {
            continue;
        };

        let mut any_below = false;
        let mut is_max = true;
        for &off in offsets {
            let Some(next) = offset_pos(pos, off, shape) else {
                continue;
            };
            if !inside(next) {
                continue;
            }
            if prob[next] > *v {
                is_max = false;
                break;
            }
            any_below |= prob[next] < *v;
        }
        if is_max && any_below {
            candidates.push((v, pos));
        }
    }

    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let sep2 = min_sep_mm * min_sep_mm;
    let mut seeds: Vec<Idx3d> = Vec::new();
    'candidate: for (_, pos) in candidates {
        for &kept in &seeds {
            if phys_dist2(pos, kept, spacing) < sep2 {
                continue 'candidate;
            }
        }
        seeds.push(pos);
    }
    seeds
}

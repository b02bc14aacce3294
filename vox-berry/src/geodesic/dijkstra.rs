//! 区域内多源最短路 (测地距离场).

use std::cmp::Ordering;

use binary_heap_plus::BinaryHeap;
use ndarray::{Array3, ArrayView3};

use crate::consts::COST_FLOOR;
use crate::labeling::{offset_pos, Connectivity};
use crate::Idx3d;

/// 距离场中 "从任何种子都不可达" 的归属哨兵.
pub(crate) const UNREACHED: usize = usize::MAX;

/// 测地距离场.
///
/// `dist` 为到最近种子的加权路径长度 (毫米), `basin` 为最近种子在
/// 种子表中的下标. 不可达体素的距离为 `f64::INFINITY`, 归属为
/// [`UNREACHED`].
pub(crate) struct DistanceField {
    pub(crate) dist: Array3<f64>,
    pub(crate) basin: Array3<usize>,
}

/// 一条 6-邻接边的测地长度.
///
/// 边长为两体素中心的物理距离乘以代价系数 `1 - (p(u) + p(v)) / 2`,
/// 下限 [`COST_FLOOR`]: 概率越高的通路越 "近", 概率洼地则拉远距离.
#[inline]
fn edge_cost(prob: &ArrayView3<'_, f32>, spacing: [f64; 3], u: Idx3d, v: Idx3d) -> f64 {
    let axis = if u.0 != v.0 {
        0
    } else if u.1 != v.1 {
        1
    } else {
        2
    };
    let mean_p = (prob[u] as f64 + prob[v] as f64) / 2.0;
    spacing[axis] * (1.0 - mean_p).max(COST_FLOOR)
}

/// 多源 Dijkstra.
///
/// 图的节点是 `passable` 判定为可通行的体素, 边为 6-邻接.
/// 到多个种子距离相同的体素归属下标较小的种子, 保证结果确定.
///
/// `seeds` 中的坐标必须可通行且互不相同, 否则程序 panic.
pub(crate) fn geodesic_field<F>(
    prob: ArrayView3<'_, f32>,
    spacing: [f64; 3],
    seeds: &[Idx3d],
    passable: F,
) -> DistanceField
where
    F: Fn(Idx3d) -> bool,
{
    let shape = prob.dim();
    let mut dist = Array3::from_elem(shape, f64::INFINITY);
    let mut basin = Array3::from_elem(shape, UNREACHED);

    // 堆顶是 (距离, 种子序) 字典序最小的候选.
    let mut heap = BinaryHeap::new_by(|a: &(f64, usize, Idx3d), b: &(f64, usize, Idx3d)| {
        b.0.total_cmp(&a.0).then_with(|| b.1.cmp(&a.1))
    });

    heap.reserve(64);
    for (i, &s) in seeds.iter().enumerate() {
        assert!(passable(s), "种子必须可通行");
        assert_eq!(basin[s], UNREACHED, "种子互不相同");
        dist[s] = 0.0;
        basin[s] = i;
        heap.push((0.0, i, s));
    }

    while let Some((d, i, pos)) = heap.pop() {
        // 过期条目: 该体素已被更近 (或同距更小种子序) 的路径接管.
        if d > dist[pos] || i != basin[pos] {
            continue;
        }
        for &off in Connectivity::Six.offsets() {
            let Some(next) = offset_pos(pos, off, shape) else {
                continue;
            };
            if !passable(next) {
                continue;
            }
            let nd = d + edge_cost(&prob, spacing, pos, next);
            let update = match nd.total_cmp(&dist[next]) {
                Ordering::Less => true,
                Ordering::Equal => i < basin[next],
                Ordering::Greater => false,
            };
            if update {
                dist[next] = nd;
                basin[next] = i;
                heap.push((nd, i, next));
            }
        }
    }

    DistanceField { dist, basin }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn float_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_straight_line_distance() {
        // 概率全 0 的通路: 代价系数为 1, 测地距离退化为物理距离.
        let prob = Array3::<f32>::zeros((1, 1, 5));
        let field = geodesic_field(prob.view(), [1.0, 1.0, 2.0], &[(0, 0, 0)], |_| true);

        assert!(float_eq(field.dist[(0, 0, 4)], 8.0));
        assert_eq!(field.basin[(0, 0, 4)], 0);
    }

    #[test]
    fn test_high_probability_shortens_path() {
        // 概率为 1 的通路只剩代价下限.
        let prob = Array3::<f32>::ones((1, 1, 3));
        let field = geodesic_field(prob.view(), [1.0; 3], &[(0, 0, 0)], |_| true);
        assert!(float_eq(field.dist[(0, 0, 2)], 2.0 * COST_FLOOR));
    }

    #[test]
    fn test_ties_go_to_lower_seed_index() {
        // 两个种子到中点等距.
        let prob = Array3::<f32>::zeros((1, 1, 5));
        let field = geodesic_field(
            prob.view(),
            [1.0; 3],
            &[(0, 0, 0), (0, 0, 4)],
            |_| true,
        );
        assert_eq!(field.basin[(0, 0, 2)], 0);
        assert_eq!(field.basin[(0, 0, 1)], 0);
        assert_eq!(field.basin[(0, 0, 3)], 1);
    }

    #[test]
    fn test_unreachable_voxels() {
        let prob = Array3::<f32>::zeros((1, 1, 5));
        // w = 2 不可通行, 把线路截成两段.
        let field = geodesic_field(prob.view(), [1.0; 3], &[(0, 0, 0)], |(_, _, w)| w != 2);
        assert_eq!(field.basin[(0, 0, 1)], 0);
        assert_eq!(field.basin[(0, 0, 2)], UNREACHED);
        assert_eq!(field.basin[(0, 0, 4)], UNREACHED);
        assert!(field.dist[(0, 0, 4)].is_infinite());
    }
}

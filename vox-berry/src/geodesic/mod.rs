//! 测地距离精化.
//!
//! 朴素连通域标注有两类典型失误: (a) 两个相互接触的真实对象被并成
//! 一个实例; (b) 一个真实对象因概率洼地被断成两个实例. 本模块在连通域
//! 结果之上做一层 "按测地距离分水岭" 的精化:
//!
//! 1. **拆分**: 对每个实例, 在其内部寻找局部概率极大值作为种子.
//!    种子多于一个时, 以多源 Dijkstra 把实例体素划入最近种子的
//!    分水岭盆地, 沿盆地边界拆分.
//! 2. **合并**: 对标注阶段产生的相邻实例对, 若两实例代表种子之间
//!    穿过概率允许区的最短测地距离低于阈值, 则并为一个实例
//!    (保留较小的 id). 拆分阶段新生成的实例不参与合并, 避免拆完又合.
//!
//! 精化是尽力而为的: 包围盒超出体素预算的实例被原样跳过, 只记录
//! 警告, 绝不导致整个体积失败.

mod dijkstra;
mod seeds;

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use ndarray::{s, Array3};

use crate::consts::label::*;
use crate::data::{LabelVolume, ScalarVolume, VolumeMetaAttr};
use crate::Idx3d;

use dijkstra::{geodesic_field, UNREACHED};
use seeds::find_seeds;

/// 精化参数.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CorrectorParams {
    /// 种子最小间隔 (毫米). 间隔内的次级极大值不成为种子.
    pub seed_min_sep_mm: f64,

    /// 两实例代表种子间测地距离低于该值时合并 (毫米).
    pub merge_below_mm: f64,

    /// 判定间隙体素 "可通行" 的概率下限.
    pub gap_prob_floor: f32,

    /// 搜索合并候选时包围盒的膨胀半径 (体素).
    pub gap_radius: usize,

    /// 单实例 (或候选实例对) 包围盒的体素预算. 超出时跳过精化.
    pub max_region_voxels: usize,
}

/// 单次精化的结果汇总.
#[derive(Debug, Clone, Default)]
pub struct CorrectionReport {
    /// 被拆分的 (原实例 id, 新增实例个数) 对.
    pub splits: Vec<(u32, u32)>,

    /// 被合并的 (保留 id, 并入 id) 对.
    pub merges: Vec<(u32, u32)>,

    /// 因超出体素预算而被跳过的实例 id.
    pub skipped: Vec<u32>,
}

impl CorrectionReport {
    /// 精化是否未作任何修改?
    #[inline]
    pub fn is_noop(&self) -> bool {
        self.splits.is_empty() && self.merges.is_empty()
    }
}

/// 实例包围盒. 两端均为闭区间.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BBox {
    lo: Idx3d,
    hi: Idx3d,
}

impl BBox {
    #[inline]
    fn single(pos: Idx3d) -> Self {
        Self { lo: pos, hi: pos }
    }

    #[inline]
    fn cover(&mut self, (z, h, w): Idx3d) {
        self.lo = (self.lo.0.min(z), self.lo.1.min(h), self.lo.2.min(w));
        self.hi = (self.hi.0.max(z), self.hi.1.max(h), self.hi.2.max(w));
    }

    /// 包围盒体素总数.
    #[inline]
    fn voxels(&self) -> usize {
        (self.hi.0 - self.lo.0 + 1) * (self.hi.1 - self.lo.1 + 1) * (self.hi.2 - self.lo.2 + 1)
    }

    /// 按半径 `r` 膨胀, 并钳制在 `shape` 内.
    fn dilate(&self, r: usize, shape: Idx3d) -> Self {
        Self {
            lo: (
                self.lo.0.saturating_sub(r),
                self.lo.1.saturating_sub(r),
                self.lo.2.saturating_sub(r),
            ),
            hi: (
                (self.hi.0 + r).min(shape.0 - 1),
                (self.hi.1 + r).min(shape.1 - 1),
                (self.hi.2 + r).min(shape.2 - 1),
            ),
        }
    }

    fn union(&self, other: &Self) -> Self {
        Self {
            lo: (
                self.lo.0.min(other.lo.0),
                self.lo.1.min(other.lo.1),
                self.lo.2.min(other.lo.2),
            ),
            hi: (
                self.hi.0.max(other.hi.0),
                self.hi.1.max(other.hi.1),
                self.hi.2.max(other.hi.2),
            ),
        }
    }

    fn intersects(&self, other: &Self) -> bool {
        self.lo.0 <= other.hi.0
            && other.lo.0 <= self.hi.0
            && self.lo.1 <= other.hi.1
            && other.lo.1 <= self.hi.1
            && self.lo.2 <= other.hi.2
            && other.lo.2 <= self.hi.2
    }
}

/// 扫描标签体, 统计每个实例的包围盒. 返回值按 id 升序.
fn bounding_boxes(labels: &LabelVolume) -> Vec<(u32, BBox)> {
    let mut boxes: BTreeMap<u32, BBox> = BTreeMap::new();
    for (pos, &v) in labels.data().indexed_iter() {
        if is_background(v) {
            continue;
        }
        boxes
            .entry(v)
            .and_modify(|b| b.cover(pos))
            .or_insert_with(|| BBox::single(pos));
    }
    boxes.into_iter().collect()
}

/// 一个实例的拆分预案.
///
/// 预案在只读视图上并行计算, 实际改写由单线程按 id 序执行,
/// 保证最终标签的确定性.
struct SplitPlan {
    id: u32,
    /// 包围盒原点.
    origin: Idx3d,
    /// 包围盒内每个体素的盆地归属 (种子下标).
    basins: Array3<usize>,
    /// 种子个数.
    n_seeds: usize,
}

/// 单个实例的拆分判定结果.
enum PlanOutcome {
    Split(SplitPlan),
    Skipped(u32),
    Keep,
}

/// 对单个实例计算拆分预案.
fn split_plan(
    labels: &LabelVolume,
    prob: &ScalarVolume,
    id: u32,
    bbox: &BBox,
    params: &CorrectorParams,
) -> PlanOutcome {
    if bbox.voxels() > params.max_region_voxels {
        warn!(
            "实例 {id} 的包围盒含 {} 体素, 超出预算 {}, 跳过精化",
            bbox.voxels(),
            params.max_region_voxels
        );
        return PlanOutcome::Skipped(id);
    }

    let label_view = labels
        .data()
        .slice(s![
            bbox.lo.0..=bbox.hi.0,
            bbox.lo.1..=bbox.hi.1,
            bbox.lo.2..=bbox.hi.2
        ])
        .to_owned();
    let prob_view = prob
        .data()
        .slice(s![
            bbox.lo.0..=bbox.hi.0,
            bbox.lo.1..=bbox.hi.1,
            bbox.lo.2..=bbox.hi.2
        ])
        .to_owned();
    let inside = |pos: Idx3d| label_view[pos] == id;

    let spacing = prob.pix_dim();
    let seeds = find_seeds(prob_view.view(), spacing, params.seed_min_sep_mm, &inside);
    if seeds.len() < 2 {
        return PlanOutcome::Keep;
    }

    let field = geodesic_field(prob_view.view(), spacing, &seeds, &inside);
    PlanOutcome::Split(SplitPlan {
        id,
        origin: bbox.lo,
        basins: field.basin,
        n_seeds: seeds.len(),
    })
}

/// 按预案改写标签体. 返回新增实例个数.
fn apply_split(labels: &mut LabelVolume, plan: &SplitPlan, next_id: &mut u32) -> u32 {
    // 0 号盆地保留原 id, 其余盆地依序领取新 id.
    let mut ids = Vec::with_capacity(plan.n_seeds);
    ids.push(plan.id);
    for _ in 1..plan.n_seeds {
        *next_id += 1;
        ids.push(*next_id);
    }

    let (oz, oh, ow) = plan.origin;
    for ((z, h, w), &basin) in plan.basins.indexed_iter() {
        if basin == UNREACHED {
            // 6-邻接下与种子不连通的体素保留原 id.
            continue;
        }
        let pos = (oz + z, oh + h, ow + w);
        if labels[pos] == plan.id {
            labels[pos] = ids[basin];
        }
    }
    (plan.n_seeds - 1) as u32
}

/// 实例 `id` 的代表种子: 实例内概率最高的体素, 平手时取低栅格序.
/// 实例为空时返回 `None`.
fn representative_seed(labels: &LabelVolume, prob: &ScalarVolume, id: u32, bbox: &BBox) -> Option<Idx3d> {
    let mut best: Option<(f32, Idx3d)> = None;
    for z in bbox.lo.0..=bbox.hi.0 {
        for h in bbox.lo.1..=bbox.hi.1 {
            for w in bbox.lo.2..=bbox.hi.2 {
                let pos = (z, h, w);
                if labels[pos] != id {
                    continue;
                }
                let p = prob[pos];
                if best.map_or(true, |(bp, _)| p > bp) {
                    best = Some((p, pos));
                }
            }
        }
    }
    best.map(|(_, pos)| pos)
}

/// 检测并精化标签体.
///
/// `labels` 与 `prob` 的形状必须一致, 否则程序 panic.
/// 精化就地修改 `labels`, 并返回修改汇总.
pub fn correct(
    labels: &mut LabelVolume,
    prob: &ScalarVolume,
    params: &CorrectorParams,
) -> CorrectionReport {
    assert_eq!(labels.shape(), prob.shape(), "标签体与概率体形状不一致");

    let mut report = CorrectionReport::default();
    let boxes = bounding_boxes(labels);
    let pre_split_ids: Vec<u32> = boxes.iter().map(|(id, _)| *id).collect();

    // 拆分预案可以按实例并行计算, 改写阶段保持单线程.
    let outcomes = plan_all(labels, prob, &boxes, params);

    let mut next_id = labels.max_label();
    for outcome in &outcomes {
        match outcome {
            PlanOutcome::Split(plan) => {
                let added = apply_split(labels, plan, &mut next_id);
                report.splits.push((plan.id, added));
            }
            PlanOutcome::Skipped(id) => report.skipped.push(*id),
            PlanOutcome::Keep => {}
        }
    }

    merge_pass(labels, prob, params, &pre_split_ids, &mut report);

    debug!(
        "精化完成: {} 次拆分, {} 次合并, {} 个实例跳过",
        report.splits.len(),
        report.merges.len(),
        report.skipped.len()
    );
    report
}

/// 对全部实例计算拆分预案, 顺序与 `boxes` 一致.
#[cfg(feature = "rayon")]
fn plan_all(
    labels: &LabelVolume,
    prob: &ScalarVolume,
    boxes: &[(u32, BBox)],
    params: &CorrectorParams,
) -> Vec<PlanOutcome> {
    use rayon::prelude::*;

    boxes
        .par_iter()
        .map(|(id, bb)| split_plan(labels, prob, *id, bb, params))
        .collect()
}

/// 对全部实例计算拆分预案, 顺序与 `boxes` 一致.
#[cfg(not(feature = "rayon"))]
fn plan_all(
    labels: &LabelVolume,
    prob: &ScalarVolume,
    boxes: &[(u32, BBox)],
    params: &CorrectorParams,
) -> Vec<PlanOutcome> {
    boxes
        .iter()
        .map(|(id, bb)| split_plan(labels, prob, *id, bb, params))
        .collect()
}

/// 实例 id 的全量替换. 启用 `rayon` 时按切片并行.
#[cfg(feature = "rayon")]
#[inline]
fn replace_label(labels: &mut LabelVolume, old: u32, new: u32) {
    labels.par_replace(old, new);
}

/// 实例 id 的全量替换.
#[cfg(not(feature = "rayon"))]
#[inline]
fn replace_label(labels: &mut LabelVolume, old: u32, new: u32) {
    labels.replace(old, new);
}

/// 合并阶段.
///
/// 只考察标注阶段就存在的实例对 (`pre_split_ids`), 拆分阶段的产物
/// 不参与, 否则刚拆开的盆地会立即被重新并拢.
fn merge_pass(
    labels: &mut LabelVolume,
    prob: &ScalarVolume,
    params: &CorrectorParams,
    pre_split_ids: &[u32],
    report: &mut CorrectionReport,
) {
    let shape = labels.shape();
    let spacing = prob.pix_dim();

    // 拆分可能改变了包围盒, 重新统计.
    let boxes: HashMap<u32, BBox> = bounding_boxes(labels)
        .into_iter()
        .filter(|(id, _)| pre_split_ids.binary_search(id).is_ok())
        .collect();

    // 已合并实例的 id 重定向.
    let mut redirect: HashMap<u32, u32> = HashMap::new();
    let resolve = |redirect: &HashMap<u32, u32>, mut id: u32| {
        while let Some(&to) = redirect.get(&id) {
            id = to;
        }
        id
    };

    for (i, &a) in pre_split_ids.iter().enumerate() {
        for &b in &pre_split_ids[i + 1..] {
            let (Some(bb_a), Some(bb_b)) = (boxes.get(&a), boxes.get(&b)) else {
                continue;
            };
            if !bb_a.dilate(params.gap_radius, shape).intersects(bb_b) {
                continue;
            }
            if resolve(&redirect, a) == resolve(&redirect, b) {
                continue;
            }

            let union = bb_a.union(bb_b).dilate(params.gap_radius, shape);
            if union.voxels() > params.max_region_voxels {
                warn!("实例对 ({a}, {b}) 的联合包围盒超出预算, 跳过合并判定");
                continue;
            }

            let (Some(seed_a), Some(seed_b)) = (
                representative_seed(labels, prob, a, bb_a),
                representative_seed(labels, prob, b, bb_b),
            ) else {
                continue;
            };

            // 在联合包围盒上做单源测地搜索, 通行域为两实例自身
            // 加上概率不低于下限的间隙体素.
            let label_view = labels
                .data()
                .slice(s![
                    union.lo.0..=union.hi.0,
                    union.lo.1..=union.hi.1,
                    union.lo.2..=union.hi.2
                ])
                .to_owned();
            let prob_view = prob
                .data()
                .slice(s![
                    union.lo.0..=union.hi.0,
                    union.lo.1..=union.hi.1,
                    union.lo.2..=union.hi.2
                ])
                .to_owned();
            let passable = |pos: Idx3d| {
                let v = label_view[pos];
                v == a || v == b || prob_view[pos] >= params.gap_prob_floor
            };

            let to_local = |(z, h, w): Idx3d| (z - union.lo.0, h - union.lo.1, w - union.lo.2);
            let field = geodesic_field(prob_view.view(), spacing, &[to_local(seed_a)], passable);

            let d = field.dist[to_local(seed_b)];
            if d < params.merge_below_mm {
                debug!("合并实例 {b} 到 {a} (种子间测地距离 {d:.3} mm)");
                replace_label(labels, b, a);
                redirect.insert(b, a);
                report.merges.push((a, b));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::{label_components, Connectivity, LabelParams};
    use ndarray::Array3;

    fn default_params() -> CorrectorParams {
        CorrectorParams {
            seed_min_sep_mm: 3.0,
            merge_below_mm: 4.0,
            gap_prob_floor: 0.25,
            gap_radius: 2,
            max_region_voxels: 100_000,
        }
    }

    fn line_volume(profile: &[f32]) -> ScalarVolume {
        let mut data = Array3::<f32>::zeros((1, 3, profile.len()));
        for (w, &v) in profile.iter().enumerate() {
            data[(0, 1, w)] = v;
        }
        ScalarVolume::from_array(data, [1.0; 3])
    }

    fn labeled(prob: &ScalarVolume) -> LabelVolume {
        let params = LabelParams {
            threshold: 0.5,
            connectivity: Connectivity::TwentySix,
            min_voxels: 1,
        };
        label_components(prob, &params).unwrap().0
    }

    #[test]
    fn test_bridged_blobs_are_split() {
        // 两个概率峰被一条低概率细桥连成一个连通域.
        let prob = line_volume(&[
            0.0, 0.7, 0.9, 0.8, 0.6, 0.55, 0.6, 0.8, 0.9, 0.7, 0.0,
        ]);
        let mut labels = labeled(&prob);
        assert_eq!(labels.instance_ids().len(), 1);

        let report = correct(&mut labels, &prob, &default_params());
        assert_eq!(report.splits, vec![(1, 1)]);
        assert!(report.merges.is_empty());

        let ids = labels.instance_ids();
        assert_eq!(ids.len(), 2);
        // 左峰保留原 id, 右峰获得新 id.
        assert_eq!(labels[(0, 1, 2)], 1);
        assert_eq!(labels[(0, 1, 8)], 2);
        assert_ne!(labels[(0, 1, 2)], labels[(0, 1, 8)]);
    }

    #[test]
    fn test_disjoint_blobs_stay_apart() {
        // 两个实例之间是概率为 0 的真空, 不可通行, 不应合并.
        let prob = line_volume(&[0.9, 0.8, 0.0, 0.0, 0.0, 0.8, 0.9]);
        let mut labels = labeled(&prob);
        assert_eq!(labels.instance_ids().len(), 2);

        let report = correct(&mut labels, &prob, &default_params());
        assert!(report.is_noop());
        assert_eq!(labels.instance_ids().len(), 2);
    }

    #[test]
    fn test_dip_separated_halves_are_merged() {
        // 一个对象被单体素概率洼地断成两个实例, 洼地仍可通行.
        let prob = line_volume(&[0.9, 0.8, 0.45, 0.8, 0.9]);
        let mut labels = labeled(&prob);
        assert_eq!(labels.instance_ids().len(), 2);

        let report = correct(&mut labels, &prob, &default_params());
        assert_eq!(report.merges, vec![(1, 2)]);
        assert_eq!(labels.instance_ids(), vec![1]);
        assert_eq!(labels[(0, 1, 0)], 1);
        assert_eq!(labels[(0, 1, 4)], 1);
    }

    #[test]
    fn test_budget_skip_keeps_label_untouched() {
        let prob = line_volume(&[
            0.0, 0.7, 0.9, 0.8, 0.6, 0.55, 0.6, 0.8, 0.9, 0.7, 0.0,
        ]);
        let mut labels = labeled(&prob);
        let before = labels.clone();

        let params = CorrectorParams {
            max_region_voxels: 4,
            ..default_params()
        };
        let report = correct(&mut labels, &prob, &params);
        assert_eq!(report.skipped, vec![1]);
        assert!(report.splits.is_empty());
        assert_eq!(labels.data(), before.data());
    }
}

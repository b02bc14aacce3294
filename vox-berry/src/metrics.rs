//! 实例分割结果与真值的匹配评估.
//!
//! 评估是纯函数: 逐体素统计重叠表, 按 IoU 降序做一对一贪心匹配,
//! 再按 IoU 阈值给出 TP/FP/FN 与准确率/召回率/F1.

use std::collections::{HashMap, HashSet};

use crate::consts::label::*;
use crate::data::{LabelVolume, VolumeMetaAttr};
use crate::error::ShapeError;

/// 一对匹配成功的 (预测实例, 真值实例).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MatchedPair {
    /// 预测实例 id.
    pub pred: u32,

    /// 真值实例 id.
    pub truth: u32,

    /// 交并比.
    pub iou: f64,

    /// Dice 系数, `2|A∩B| / (|A| + |B|)`.
    pub dice: f64,
}

/// 评估报告.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsReport {
    /// 匹配计入 TP 所需的最低 IoU.
    pub iou_threshold: f64,

    /// 全部达到阈值的一对一匹配, 按 IoU 降序.
    pub pairs: Vec<MatchedPair>,

    /// 真阳性个数 (达到阈值的匹配对数).
    pub true_positive: u32,

    /// 假阳性个数 (未匹配的预测实例数).
    pub false_positive: u32,

    /// 假阴性个数 (未匹配的真值实例数).
    pub false_negative: u32,
}

impl MetricsReport {
    /// 准确率 `TP / (TP + FP)`. 分母为零时返回 0.
    pub fn precision(&self) -> f64 {
        let denom = self.true_positive + self.false_positive;
        if denom == 0 {
            return 0.0;
        }
        self.true_positive as f64 / denom as f64
    }

    /// 召回率 `TP / (TP + FN)`. 分母为零时返回 0.
    pub fn recall(&self) -> f64 {
        let denom = self.true_positive + self.false_negative;
        if denom == 0 {
            return 0.0;
        }
        self.true_positive as f64 / denom as f64
    }

    /// F1 分数, 准确率与召回率的调和平均. 两者皆零时返回 0.
    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            return 0.0;
        }
        2.0 * p * r / (p + r)
    }

    /// 匹配对的平均 IoU. 无匹配时返回 0.
    pub fn mean_matched_iou(&self) -> f64 {
        if self.pairs.is_empty() {
            return 0.0;
        }
        self.pairs.iter().map(|p| p.iou).sum::<f64>() / self.pairs.len() as f64
    }
}

/// 序列化存储部分
#[cfg(feature = "serde")]
impl MetricsReport {
    /// 以 bincode 格式把报告写入 `path`.
    pub fn save_bin<P: AsRef<std::path::Path>>(&self, path: P) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        bincode::serialize_into(file, self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// 从 `path` 读回 bincode 格式的报告.
    pub fn load_bin<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        bincode::deserialize_from(file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// 评估预测标签体与真值标签体.
///
/// 匹配是一对一的: 候选对按 IoU 降序 (平手时按 (预测 id, 真值 id)
/// 升序) 依次锁定, 已被占用的实例不再参与后续配对. IoU 不低于
/// `iou_threshold` 的配对计为 TP.
///
/// # 错误
///
/// 两个标签体形状不一致时返回 [`ShapeError`].
pub fn evaluate(
    pred: &LabelVolume,
    truth: &LabelVolume,
    iou_threshold: f64,
) -> Result<MetricsReport, ShapeError> {
    let (ps, ts) = (pred.shape(), truth.shape());
    for (axis, (e, a)) in [(ts.0, ps.0), (ts.1, ps.1), (ts.2, ps.2)]
        .into_iter()
        .enumerate()
    {
        if e != a {
            return Err(ShapeError {
                axis,
                expected: e,
                actual: a,
            });
        }
    }

    // 单遍统计: 各实例体素数与两两重叠体素数.
    let mut pred_sizes: HashMap<u32, usize> = HashMap::new();
    let mut truth_sizes: HashMap<u32, usize> = HashMap::new();
    let mut overlap: HashMap<(u32, u32), usize> = HashMap::new();

    for (&p, &t) in pred.data().iter().zip(truth.data().iter()) {
        if is_instance(p) {
            *pred_sizes.entry(p).or_insert(0) += 1;
        }
        if is_instance(t) {
            *truth_sizes.entry(t).or_insert(0) += 1;
        }
        if is_instance(p) && is_instance(t) {
            *overlap.entry((p, t)).or_insert(0) += 1;
        }
    }

    // 候选对按 IoU 降序, 平手时按 id 升序, 保证贪心结果确定.
    let mut candidates: Vec<MatchedPair> = overlap
        .iter()
        .map(|(&(p, t), &inter)| {
            let union = pred_sizes[&p] + truth_sizes[&t] - inter;
            MatchedPair {
                pred: p,
                truth: t,
                iou: inter as f64 / union as f64,
                dice: 2.0 * inter as f64 / (pred_sizes[&p] + truth_sizes[&t]) as f64,
            }
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.iou
            .total_cmp(&a.iou)
            .then_with(|| (a.pred, a.truth).cmp(&(b.pred, b.truth)))
    });

    let mut used_pred: HashSet<u32> = HashSet::new();
    let mut used_truth: HashSet<u32> = HashSet::new();
    let mut pairs = Vec::new();
    for cand in candidates {
        if cand.iou < iou_threshold {
            break;
        }
        if used_pred.contains(&cand.pred) || used_truth.contains(&cand.truth) {
            continue;
        }
        used_pred.insert(cand.pred);
        used_truth.insert(cand.truth);
        pairs.push(cand);
    }

    let tp = pairs.len() as u32;
    Ok(MetricsReport {
        iou_threshold,
        true_positive: tp,
        false_positive: pred_sizes.len() as u32 - tp,
        false_negative: truth_sizes.len() as u32 - tp,
        pairs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LabelVolume;
    use ndarray::Array3;

    fn volume_of(assign: &[(crate::Idx3d, u32)], shape: crate::Idx3d) -> LabelVolume {
        let mut data = Array3::zeros(shape);
        for &(pos, id) in assign {
            data[pos] = id;
        }
        LabelVolume::from_array(data, [1.0; 3])
    }

    fn float_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_hand_computed_iou_scenario() {
        // 预测: 实例 1 占 A = {w0..3}, 实例 2 占 B = {w5..6}.
        // 真值: 实例 1 占 A 加上 B 的一个边界体素 w5.
        let pred = volume_of(
            &[
                ((0, 0, 0), 1),
                ((0, 0, 1), 1),
                ((0, 0, 2), 1),
                ((0, 0, 3), 1),
                ((0, 0, 5), 2),
                ((0, 0, 6), 2),
            ],
            (1, 1, 8),
        );
        let truth = volume_of(
            &[
                ((0, 0, 0), 1),
                ((0, 0, 1), 1),
                ((0, 0, 2), 1),
                ((0, 0, 3), 1),
                ((0, 0, 5), 1),
            ],
            (1, 1, 8),
        );

        let report = evaluate(&pred, &truth, 0.5).unwrap();

        // 预测 1 vs 真值 1: 交 4, 并 5, IoU = 0.8 -> TP.
        // 预测 2 vs 真值 1: 真值 1 已被占用, 且 IoU = 1/6 也低于阈值.
        assert_eq!(report.true_positive, 1);
        assert_eq!(report.false_positive, 1);
        assert_eq!(report.false_negative, 0);

        assert_eq!(report.pairs.len(), 1);
        let m = report.pairs[0];
        assert_eq!((m.pred, m.truth), (1, 1));
        assert!(float_eq(m.iou, 4.0 / 5.0));
        assert!(float_eq(m.dice, 8.0 / 9.0));

        assert!(float_eq(report.precision(), 0.5));
        assert!(float_eq(report.recall(), 1.0));
        assert!(float_eq(report.f1(), 2.0 / 3.0));
    }

    #[test]
    fn test_greedy_is_one_to_one() {
        // 一个大预测实例同时覆盖两个真值实例, 只能匹配其中之一.
        let pred = volume_of(
            &[((0, 0, 0), 1), ((0, 0, 1), 1), ((0, 0, 2), 1)],
            (1, 1, 3),
        );
        let truth = volume_of(
            &[((0, 0, 0), 1), ((0, 0, 1), 1), ((0, 0, 2), 2)],
            (1, 1, 3),
        );

        let report = evaluate(&pred, &truth, 0.25).unwrap();
        assert_eq!(report.true_positive, 1);
        assert_eq!(report.false_positive, 0);
        assert_eq!(report.false_negative, 1);
        assert_eq!((report.pairs[0].pred, report.pairs[0].truth), (1, 1));
    }

    #[test]
    fn test_shape_mismatch() {
        let a = volume_of(&[], (1, 2, 2));
        let b = volume_of(&[], (1, 2, 3));
        let err = evaluate(&a, &b, 0.5).unwrap_err();
        assert_eq!(err.axis, 2);
        assert_eq!(err.expected, 3);
        assert_eq!(err.actual, 2);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_report_bin_roundtrip() {
        let pred = volume_of(&[((0, 0, 0), 1), ((0, 0, 1), 1)], (1, 1, 3));
        let report = evaluate(&pred, &pred.clone(), 0.5).unwrap();

        let mut path = std::env::temp_dir();
        path.push("vox_berry_metrics_report.bin");
        report.save_bin(&path).unwrap();
        let loaded = MetricsReport::load_bin(&path).unwrap();
        assert_eq!(report, loaded);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_empty_volumes() {
        let a = volume_of(&[], (1, 2, 2));
        let report = evaluate(&a, &a.clone(), 0.5).unwrap();
        assert_eq!(report.true_positive, 0);
        assert_eq!(report.precision(), 0.0);
        assert_eq!(report.recall(), 0.0);
        assert_eq!(report.f1(), 0.0);
        assert_eq!(report.mean_matched_iou(), 0.0);
    }
}

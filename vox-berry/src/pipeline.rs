//! 端到端后处理流水线.
//!
//! 流程: patch 网格 -> 推理 -> 拼接 -> 连通域标注 -> 测地精化.
//! 几何与配置错误立即失败; 单个 patch 的模型错误放弃整个体积;
//! 精化预算超限只降级. 多个体积可以在上层并发地各自跑一条流水线,
//! 流水线内部不共享可变状态.

use std::num::NonZeroUsize;

use log::debug;

use crate::data::{LabelVolume, ScalarVolume, VolumeMetaAttr};
use crate::error::PipelineError;
use crate::geodesic::{correct, CorrectionReport, CorrectorParams};
use crate::infer::{InferenceRunner, Predictor, PredictionPatch};
use crate::labeling::{label_components, Connectivity, LabelParams};
use crate::metrics::{evaluate, MetricsReport};
use crate::stitch::{BlendMode, Stitcher};
use crate::tile::{EdgeRule, TileGrid};
use crate::Idx3d;

/// 流水线完整配置.
///
/// 所有选项显式给出, 各阶段不再隐藏任何默认值. 预设构造器只是
/// 把一组显式取值打包, 不改变这一点.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineConfig {
    /// patch 形状.
    pub patch_shape: Idx3d,

    /// patch 滑动步长. 不得超过 `patch_shape`.
    pub stride: Idx3d,

    /// 边缘 patch 的处理规则.
    pub edge_rule: EdgeRule,

    /// 重叠区融合模式.
    pub blend: BlendMode,

    /// 一批并行提交推理的 patch 个数上限.
    pub batch: NonZeroUsize,

    /// 二值化与连通域标注参数.
    pub label: LabelParams,

    /// 测地精化参数.
    pub corrector: CorrectorParams,

    /// 实例匹配计入 TP 所需的最低 IoU (用于评估阶段).
    pub iou_threshold: f64,
}

impl PipelineConfig {
    /// 细胞核尺度实例的参考配置.
    ///
    /// 64^3 patch, 半步重叠, 线性斜坡融合; 阈值 0.5, 26-连通,
    /// 27 体素 (3^3) 以下视为噪声; 种子间隔 4mm, 合并阈值 2mm.
    pub fn nuclei_preset() -> Self {
        Self {
            patch_shape: (64, 64, 64),
            stride: (32, 32, 32),
            edge_rule: EdgeRule::Pad(0.0),
            blend: BlendMode::LinearRamp,
            batch: NonZeroUsize::new(4).unwrap(),
            label: LabelParams {
                threshold: 0.5,
                connectivity: Connectivity::TwentySix,
                min_voxels: 27,
            },
            corrector: CorrectorParams {
                seed_min_sep_mm: 4.0,
                merge_below_mm: 2.0,
                gap_prob_floor: 0.25,
                gap_radius: 2,
                max_region_voxels: 2_000_000,
            },
            iou_threshold: 0.5,
        }
    }
}

/// 流水线输出.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// 拼接后的全体积概率图.
    pub prob: ScalarVolume,

    /// 精化后的实例标签体.
    pub labels: LabelVolume,

    /// 最终实例个数.
    pub instances: u32,

    /// 精化阶段的修改汇总.
    pub correction: CorrectionReport,
}

/// 对单个体积执行完整后处理.
///
/// `model` 是注入的外部推理能力, 流水线对其内部一无所知.
pub fn run<P: Predictor>(
    vol: &ScalarVolume,
    model: &P,
    cfg: &PipelineConfig,
) -> Result<PipelineOutput, PipelineError> {
    let grid = TileGrid::new(vol.shape(), cfg.patch_shape, cfg.stride, cfg.edge_rule)?;
    debug!("patch 网格: {} 个 patch, 步长 {:?}", grid.len(), cfg.stride);

    let runner = InferenceRunner::new(cfg.batch);
    let preds = run_inference(&runner, &grid, vol, model)?;

    let stitcher = Stitcher::new(vol.meta().clone(), cfg.blend);
    let prob = run_stitch(&stitcher, preds)?;

    let (mut labels, initial) = label_components(&prob, &cfg.label)?;
    debug!("初始实例数: {initial}");

    let correction = correct(&mut labels, &prob, &cfg.corrector);
    let instances = labels.instance_ids().len() as u32;
    debug!("最终实例数: {instances}");

    Ok(PipelineOutput {
        prob,
        labels,
        instances,
        correction,
    })
}

/// 执行流水线并对照真值评估.
///
/// 评估使用 `cfg.iou_threshold`, 不修改任何输入.
pub fn run_with_truth<P: Predictor>(
    vol: &ScalarVolume,
    model: &P,
    truth: &LabelVolume,
    cfg: &PipelineConfig,
) -> Result<(PipelineOutput, MetricsReport), PipelineError> {
    let output = run(vol, model, cfg)?;
    let report = evaluate(&output.labels, truth, cfg.iou_threshold)?;
    Ok((output, report))
}

#[cfg(feature = "rayon")]
#[inline]
fn run_inference<P: Predictor>(
    runner: &InferenceRunner,
    grid: &TileGrid,
    vol: &ScalarVolume,
    model: &P,
) -> Result<Vec<PredictionPatch>, PipelineError> {
    runner.par_run(grid, vol, model)
}

#[cfg(not(feature = "rayon"))]
#[inline]
fn run_inference<P: Predictor>(
    runner: &InferenceRunner,
    grid: &TileGrid,
    vol: &ScalarVolume,
    model: &P,
) -> Result<Vec<PredictionPatch>, PipelineError> {
    runner.run(grid, vol, model)
}

#[cfg(feature = "rayon")]
#[inline]
fn run_stitch(
    stitcher: &Stitcher,
    preds: Vec<PredictionPatch>,
) -> Result<ScalarVolume, PipelineError> {
    Ok(stitcher.par_stitch(preds)?)
}

#[cfg(not(feature = "rayon"))]
#[inline]
fn run_stitch(
    stitcher: &Stitcher,
    preds: Vec<PredictionPatch>,
) -> Result<ScalarVolume, PipelineError> {
    Ok(stitcher.stitch(preds)?)
}

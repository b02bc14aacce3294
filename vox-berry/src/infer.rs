//! patch 推理执行器.
//!
//! 执行器自身与模型完全解耦: 模型以注入的 [`Predictor`] 能力出现,
//! 执行器只负责批量调度, 形状校验与错误包装. 模型失败不是瞬态的,
//! 不做重试, 单个 patch 失败即放弃整个体积.

use std::num::NonZeroUsize;

use log::debug;
use ndarray::{Array3, ArrayView3};

use crate::data::ScalarVolume;
use crate::error::{BoxedModelError, InferenceError, PipelineError, ShapeError};
use crate::tile::{Patch, TileGrid};
use crate::Idx3d;

/// 外部模型能力. 输入一个 patch 的体素数组, 输出同空间形状的
/// 单通道概率数组.
///
/// 该接口是注入式的: 流水线不关心模型来自哪个后端, 只要求它同步,
/// 无副作用地完成 array -> array 变换. 多通道输出的模型应在适配层
/// 先折叠成单通道前景概率.
pub trait Predictor: Sync {
    /// 对一个 patch 执行推理.
    fn predict(&self, patch: ArrayView3<'_, f32>) -> Result<Array3<f32>, BoxedModelError>;
}

impl<F> Predictor for F
where
    F: Fn(ArrayView3<'_, f32>) -> Result<Array3<f32>, BoxedModelError> + Sync,
{
    #[inline]
    fn predict(&self, patch: ArrayView3<'_, f32>) -> Result<Array3<f32>, BoxedModelError> {
        self(patch)
    }
}

/// 一个 patch 的推理结果.
#[derive(Debug, Clone)]
pub struct PredictionPatch {
    origin: Idx3d,
    extent: Idx3d,
    prob: Array3<f32>,
}

impl PredictionPatch {
    /// 直接构造推理结果.
    ///
    /// `extent` 各分量不得超过 `prob` 的形状, 否则程序 panic.
    pub fn new(origin: Idx3d, extent: Idx3d, prob: Array3<f32>) -> Self {
        let dim = prob.dim();
        assert!(
            extent.0 <= dim.0 && extent.1 <= dim.1 && extent.2 <= dim.2,
            "有效范围超出概率数组形状"
        );
        Self {
            origin,
            extent,
            prob,
        }
    }

    /// patch 原点在父体积中的坐标.
    #[inline]
    pub fn origin(&self) -> Idx3d {
        self.origin
    }

    /// 有效范围 (不含补齐部分).
    #[inline]
    pub fn extent(&self) -> Idx3d {
        self.extent
    }

    /// 概率数组.
    #[inline]
    pub fn prob(&self) -> &Array3<f32> {
        &self.prob
    }
}

/// patch 推理执行器.
#[derive(Debug, Clone)]
pub struct InferenceRunner {
    batch: NonZeroUsize,
}

impl InferenceRunner {
    /// 构建执行器. `batch` 为一批并行提交的 patch 个数上限.
    #[inline]
    pub fn new(batch: NonZeroUsize) -> Self {
        Self { batch }
    }

    /// 批大小.
    #[inline]
    pub fn batch(&self) -> usize {
        self.batch.get()
    }

    /// 按栅格序对网格内全部 patch 执行推理.
    ///
    /// 任一 patch 失败都会立即返回错误, 错误附带该 patch 的原点.
    pub fn run<P: Predictor>(
        &self,
        grid: &TileGrid,
        vol: &ScalarVolume,
        model: &P,
    ) -> Result<Vec<PredictionPatch>, PipelineError> {
        let mut out = Vec::with_capacity(grid.len());
        for patch in grid.split(vol) {
            out.push(run_one(model, &patch)?);
        }
        debug!("推理完成: {} 个 patch", out.len());
        Ok(out)
    }

    /// [`Self::run`] 的并行版本.
    ///
    /// patch 按批切分, 批内经 `rayon` 并行提交, 工作池大小即为反压上限.
    /// 结果仍按栅格序返回.
    #[cfg(feature = "rayon")]
    pub fn par_run<P: Predictor>(
        &self,
        grid: &TileGrid,
        vol: &ScalarVolume,
        model: &P,
    ) -> Result<Vec<PredictionPatch>, PipelineError> {
        use rayon::prelude::*;

        let patches: Vec<Patch> = grid.split(vol).collect();
        let mut out = Vec::with_capacity(patches.len());
        for batch in patches.chunks(self.batch.get()) {
            let preds: Result<Vec<_>, PipelineError> =
                batch.par_iter().map(|p| run_one(model, p)).collect();
            out.extend(preds?);
        }
        debug!("并行推理完成: {} 个 patch", out.len());
        Ok(out)
    }
}

/// 单个 patch 的推理与形状校验.
fn run_one<P: Predictor>(model: &P, patch: &Patch) -> Result<PredictionPatch, PipelineError> {
    let prob = model
        .predict(patch.data().view())
        .map_err(|source| InferenceError {
            origin: patch.origin(),
            source,
        })?;

    // 模型必须保持空间形状.
    let expected = patch.shape();
    let actual = prob.dim();
    for (axis, (e, a)) in [
        (expected.0, actual.0),
        (expected.1, actual.1),
        (expected.2, actual.2),
    ]
    .into_iter()
    .enumerate()
    {
        if e != a {
            return Err(ShapeError {
                axis,
                expected: e,
                actual: a,
            }
            .into());
        }
    }

    Ok(PredictionPatch::new(patch.origin(), patch.extent(), prob))
}

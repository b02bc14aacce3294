//! 重叠 patch 预测的拼接.
//!
//! 权重类融合模式 (`Average`, `LinearRamp`) 的累加是逐体素的加法,
//! 满足交换律和结合律, 因此结果与 patch 的处理顺序无关; 并行拼接
//! 利用这一点让每个 worker 持有部分累加器, 最后按固定顺序合并,
//! 避免对共享数组加锁.

use itertools::izip;
use log::debug;
use ndarray::{s, Array3};
use num::Float;

use crate::consts::UNWRITTEN;
use crate::data::{ScalarVolume, VolumeMeta};
use crate::error::CoverageGap;
use crate::infer::PredictionPatch;
use crate::Idx3d;

/// 重叠区的融合规则.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlendMode {
    /// 后写者覆盖前写者. 结果依赖 patch 的处理顺序, 约定为栅格序.
    Overwrite,

    /// 逐体素等权平均. 结果与 patch 处理顺序无关.
    Average,

    /// 权重从 patch 中心向边缘线性衰减, 用于抑制拼接缝.
    /// 结果与 patch 处理顺序无关.
    LinearRamp,
}

/// 一维三角权重: 距 patch 有效范围边缘越远权重越大,
/// 在边缘处衰减到 1.
#[inline]
fn ramp1<T: Float>(i: usize, n: usize) -> T {
    debug_assert!(i < n);
    let near = (i + 1).min(n - i);
    T::from(near).unwrap()
}

/// `LinearRamp` 模式下局部坐标 `pos` 处的融合权重.
///
/// 三个轴的三角权重相乘, 只在 patch 的有效范围内定义.
#[inline]
fn ramp_weight<T: Float>((z, h, w): Idx3d, (ez, eh, ew): Idx3d) -> T {
    ramp1::<T>(z, ez) * ramp1::<T>(h, eh) * ramp1::<T>(w, ew)
}

/// 把 patch 预测折叠回完整体积的拼接器.
#[derive(Debug, Clone)]
pub struct Stitcher {
    meta: VolumeMeta,
    blend: BlendMode,
}

impl Stitcher {
    /// 构建拼接器. `meta` 描述输出体积的形状与物理间距.
    #[inline]
    pub fn new(meta: VolumeMeta, blend: BlendMode) -> Self {
        Self { meta, blend }
    }

    /// 融合模式.
    #[inline]
    pub fn blend(&self) -> BlendMode {
        self.blend
    }

    /// 顺序拼接.
    ///
    /// patch 超出输出形状时程序 panic (属于网格配置与拼接器不一致).
    ///
    /// # 错误
    ///
    /// 所有 patch 折叠完成后仍存在未被写入的体素时, 返回
    /// [`CoverageGap`]. 这是致命错误, 未覆盖体素以
    /// [`UNWRITTEN`] 填充后整体丢弃.
    pub fn stitch<I>(&self, patches: I) -> Result<ScalarVolume, CoverageGap>
    where
        I: IntoIterator<Item = PredictionPatch>,
    {
        let mut acc = Accumulator::new(self.meta.shape(), self.blend);
        for p in patches {
            acc.fold(&p);
        }
        acc.finish(self.meta.clone())
    }

    /// [`Self::stitch`] 的并行版本.
    ///
    /// patch 均分为若干段, 每段由一个 worker 折叠进自己的部分累加器,
    /// 最后在单线程中按段序合并. 对 `Average`/`LinearRamp` 两种模式,
    /// 结果与顺序版本在浮点意义上一致; `Overwrite` 模式的段序合并
    /// 保持了 "栅格序后写者获胜" 的语义.
    #[cfg(feature = "rayon")]
    pub fn par_stitch(&self, patches: Vec<PredictionPatch>) -> Result<ScalarVolume, CoverageGap> {
        use rayon::prelude::*;

        let workers = rayon::current_num_threads().max(1);
        let chunk = patches.len().div_ceil(workers).max(1);

        let partials: Vec<Accumulator> = patches
            .par_chunks(chunk)
            .map(|seg| {
                let mut acc = Accumulator::new(self.meta.shape(), self.blend);
                seg.iter().for_each(|p| acc.fold(p));
                acc
            })
            .collect();

        // 合并顺序是固定的 (par_chunks 保序), 保证确定性.
        let mut merged = Accumulator::new(self.meta.shape(), self.blend);
        for part in partials {
            merged.merge(part);
        }
        merged.finish(self.meta.clone())
    }
}

/// 部分累加器.
///
/// `sum` 与 `weight` 以 `f64` 精度累加, 避免大量小权重相加时的精度损失.
struct Accumulator {
    blend: BlendMode,
    sum: Array3<f64>,
    weight: Array3<f64>,
}

impl Accumulator {
    fn new(shape: Idx3d, blend: BlendMode) -> Self {
        Self {
            blend,
            sum: Array3::zeros(shape),
            weight: Array3::zeros(shape),
        }
    }

    /// 把一个 patch 的有效范围折叠进累加器. 补齐部分被裁掉.
    fn fold(&mut self, p: &PredictionPatch) {
        let (z, h, w) = p.origin();
        let (ez, eh, ew) = p.extent();
        let out_shape = self.sum.dim();
        assert!(
            z + ez <= out_shape.0 && h + eh <= out_shape.1 && w + ew <= out_shape.2,
            "patch 超出输出形状"
        );

        let region = s![z..z + ez, h..h + eh, w..w + ew];
        let mut sum = self.sum.slice_mut(region);
        let mut weight = self.weight.slice_mut(region);
        let prob = p.prob().slice(s![..ez, ..eh, ..ew]);

        match self.blend {
            BlendMode::Overwrite => {
                izip!(sum.iter_mut(), weight.iter_mut(), prob.iter()).for_each(
                    |(s, w, &v)| {
                        *s = v as f64;
                        *w = 1.0;
                    },
                );
            }
            BlendMode::Average => {
                izip!(sum.iter_mut(), weight.iter_mut(), prob.iter()).for_each(
                    |(s, w, &v)| {
                        *s += v as f64;
                        *w += 1.0;
                    },
                );
            }
            BlendMode::LinearRamp => {
                for (pos, &v) in prob.indexed_iter() {
                    let wt: f64 = ramp_weight(pos, (ez, eh, ew));
                    sum[pos] += wt * v as f64;
                    weight[pos] += wt;
                }
            }
        }
    }

    /// 把另一个部分累加器并入 `self`. `other` 在合并顺序上视为后来者.
    fn merge(&mut self, other: Accumulator) {
        debug_assert_eq!(self.sum.dim(), other.sum.dim());

        match self.blend {
            BlendMode::Overwrite => {
                // 后来者覆盖已写入的体素.
                izip!(
                    self.sum.iter_mut(),
                    self.weight.iter_mut(),
                    other.sum.iter(),
                    other.weight.iter()
                )
                .for_each(|(s, w, &os, &ow)| {
                    if ow > 0.0 {
                        *s = os;
                        *w = ow;
                    }
                });
            }
            BlendMode::Average | BlendMode::LinearRamp => {
                izip!(
                    self.sum.iter_mut(),
                    self.weight.iter_mut(),
                    other.sum.iter(),
                    other.weight.iter()
                )
                .for_each(|(s, w, &os, &ow)| {
                    *s += os;
                    *w += ow;
                });
            }
        }
    }

    /// 归一化并检查覆盖性.
    fn finish(self, meta: VolumeMeta) -> Result<ScalarVolume, CoverageGap> {
        let mut missing = 0usize;
        let mut first = None;

        let mut out = Array3::<f32>::zeros(self.sum.dim());
        for ((pos, o), (&s, &w)) in out
            .indexed_iter_mut()
            .zip(self.sum.iter().zip(self.weight.iter()))
        {
            if w > 0.0 {
                *o = (s / w) as f32;
            } else {
                *o = UNWRITTEN;
                missing += 1;
                first.get_or_insert(pos);
            }
        }

        if let Some(first) = first {
            return Err(CoverageGap { first, missing });
        }
        debug!("拼接完成: 输出形状 {:?}", out.dim());
        Ok(ScalarVolume::from_parts(meta, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::VolumeMetaAttr;
    use crate::infer::PredictionPatch;
    use ndarray::Array3;

    fn patch(origin: Idx3d, extent: Idx3d, value: f32) -> PredictionPatch {
        PredictionPatch::new(origin, extent, Array3::from_elem(extent, value))
    }

    fn float_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_overwrite_last_writer_wins() {
        let st = Stitcher::new(VolumeMeta::isotropic((2, 2, 2)), BlendMode::Overwrite);
        let out = st
            .stitch([
                patch((0, 0, 0), (2, 2, 2), 0.2),
                patch((0, 0, 0), (1, 2, 2), 0.8),
            ])
            .unwrap();
        assert!(float_eq(out[(0, 0, 0)], 0.8));
        assert!(float_eq(out[(1, 0, 0)], 0.2));
    }

    #[test]
    fn test_average_blend() {
        let st = Stitcher::new(VolumeMeta::isotropic((1, 1, 2)), BlendMode::Average);
        let out = st
            .stitch([
                patch((0, 0, 0), (1, 1, 2), 0.0),
                patch((0, 0, 0), (1, 1, 1), 1.0),
            ])
            .unwrap();
        assert!(float_eq(out[(0, 0, 0)], 0.5));
        assert!(float_eq(out[(0, 0, 1)], 0.0));
    }

    #[test]
    fn test_average_order_independent() {
        let st = Stitcher::new(VolumeMeta::isotropic((2, 3, 4)), BlendMode::Average);
        let mut patches = vec![
            patch((0, 0, 0), (2, 3, 2), 0.3),
            patch((0, 0, 2), (2, 3, 2), 0.9),
            patch((0, 1, 1), (1, 2, 2), 0.6),
            patch((1, 0, 0), (1, 3, 4), 0.1),
        ];
        let a = st.stitch(patches.clone()).unwrap();
        patches.reverse();
        let b = st.stitch(patches).unwrap();

        assert!(a
            .data()
            .iter()
            .zip(b.data().iter())
            .all(|(x, y)| float_eq(*x, *y)));
    }

    #[test]
    fn test_linear_ramp_suppresses_edges() {
        // 两个相互重叠的 patch: 重叠区内靠近 patch A 中心的体素
        // 应更多地采信 A 的值.
        let st = Stitcher::new(VolumeMeta::isotropic((1, 1, 6)), BlendMode::LinearRamp);
        let out = st
            .stitch([
                patch((0, 0, 0), (1, 1, 4), 1.0),
                patch((0, 0, 2), (1, 1, 4), 0.0),
            ])
            .unwrap();

        // w=2: A 的权重 min(3, 2)=2, B 的权重 min(1, 4)=1 -> 2/3.
        assert!(float_eq(out[(0, 0, 2)], 2.0 / 3.0));
        // w=3: A 的权重 1, B 的权重 2 -> 1/3.
        assert!(float_eq(out[(0, 0, 3)], 1.0 / 3.0));
        assert!(float_eq(out[(0, 0, 0)], 1.0));
        assert!(float_eq(out[(0, 0, 5)], 0.0));
    }

    #[test]
    fn test_coverage_gap_is_fatal() {
        let st = Stitcher::new(VolumeMeta::isotropic((1, 2, 2)), BlendMode::Average);
        let err = st.stitch([patch((0, 0, 0), (1, 1, 2), 0.5)]).unwrap_err();
        assert_eq!(err.first, (0, 1, 0));
        assert_eq!(err.missing, 2);
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn test_par_stitch_matches_sequential() {
        let st = Stitcher::new(VolumeMeta::isotropic((3, 5, 5)), BlendMode::LinearRamp);
        let patches: Vec<_> = (0..3)
            .flat_map(|z| {
                (0..2).flat_map(move |h| {
                    (0..2).map(move |w| {
                        patch(
                            (z, h * 2, w * 2),
                            (1, 3, 3),
                            (z + h + w) as f32 / 4.0,
                        )
                    })
                })
            })
            .collect();

        let seq = st.stitch(patches.clone()).unwrap();
        let par = st.par_stitch(patches).unwrap();
        assert_eq!(seq.shape(), par.shape());
        assert!(seq
            .data()
            .iter()
            .zip(par.data().iter())
            .all(|(a, b)| float_eq(*a, *b)));
    }
}

//! 融合模式消融算法.
//!
//! 每个模式在同一批体积上执行相同的流程: 分块, 给每个 patch 叠加由
//! 原点决定的常量偏置 (模拟模型在不同 patch 上输出的轻微不一致),
//! 拼接, 标注, 精化. 融合模式越能压制 patch 间分歧, 重建误差与
//! 精化修改量越小.

mod profile;

pub use profile::Profile;

use std::time::Instant;

use vox_berry::geodesic::correct;
use vox_berry::infer::PredictionPatch;
use vox_berry::labeling::label_components;
use vox_berry::stitch::{BlendMode, Stitcher};
use vox_berry::tile::TileGrid;
use vox_berry::{Idx3d, ScalarVolume, VolumeMetaAttr};

/// overwrite 模式.
pub fn overwrite(volumes: &[ScalarVolume]) -> Profile {
    run_mode(volumes, BlendMode::Overwrite)
}

/// average 模式.
pub fn average(volumes: &[ScalarVolume]) -> Profile {
    run_mode(volumes, BlendMode::Average)
}

/// linear-ramp 模式.
pub fn linear_ramp(volumes: &[ScalarVolume]) -> Profile {
    run_mode(volumes, BlendMode::LinearRamp)
}

/// 以给定融合模式跑完整批体积.
fn run_mode(volumes: &[ScalarVolume], blend: BlendMode) -> Profile {
    let cfg = utils::reference_config();
    let mut profile = Profile::new();

    for vol in volumes {
        let clock = Instant::now();

        let grid = TileGrid::new(vol.shape(), cfg.patch_shape, cfg.stride, cfg.edge_rule)
            .expect("patch 网格配置错误");
        let preds: Vec<PredictionPatch> = grid
            .split(vol)
            .map(|p| {
                let bias = origin_bias(p.origin());
                PredictionPatch::new(
                    p.origin(),
                    p.extent(),
                    p.data().mapv(|v| (v + bias).clamp(0.0, 1.0)),
                )
            })
            .collect();

        let stitched = Stitcher::new(vol.meta().clone(), blend)
            .stitch(preds)
            .expect("网格存在覆盖缺口");
        let seam_err = mean_abs_diff(vol, &stitched);

        let (mut labels, _) = label_components(&stitched, &cfg.label).expect("阈值非法");
        let snapshot = labels.compact_snapshot();
        correct(&mut labels, &stitched, &cfg.corrector);

        let refined: u64 = snapshot
            .iter()
            .enumerate()
            .map(|(z, compact)| compact.diff(&labels.slice_at(z)).len() as u64)
            .sum();

        profile.record(clock.elapsed(), seam_err, refined);
    }
    profile
}

/// 由 patch 原点确定的常量偏置, 取值范围 \[-0.05, 0.05\].
fn origin_bias((z, h, w): Idx3d) -> f32 {
    let mix = (z.wrapping_mul(73_856_093) ^ h.wrapping_mul(19_349_663) ^ w.wrapping_mul(83_492_791))
        as u32;
    ((mix % 101) as f32 / 100.0 - 0.5) * 0.1
}

/// 逐体素平均绝对误差.
fn mean_abs_diff(a: &ScalarVolume, b: &ScalarVolume) -> f64 {
    debug_assert_eq!(a.shape(), b.shape());
    let sum: f64 = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(x, y)| (x - y).abs() as f64)
        .sum();
    sum / a.size() as f64
}

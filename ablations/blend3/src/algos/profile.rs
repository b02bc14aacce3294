//! 运行画像.

use std::time::Duration;

/// 单个融合模式在整个实验中的运行画像.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    volumes: u32,
    total_time: Duration,
    most_time: Option<Duration>,
    seam_err_sum: f64,
    refined_voxels: u64,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个体积的运行结果.
    pub fn record(&mut self, elapsed: Duration, seam_err: f64, refined: u64) {
        self.volumes += 1;
        self.total_time += elapsed;
        self.most_time = Some(self.most_time.map_or(elapsed, |m| m.max(elapsed)));
        self.seam_err_sum += seam_err;
        self.refined_voxels += refined;
    }

    /// 已处理体积个数.
    pub fn get_volumes(&self) -> u32 {
        self.volumes
    }

    /// 总耗时 (微秒).
    pub fn get_total_time_us(&self) -> u128 {
        self.total_time.as_micros()
    }

    /// 平均重建误差. 尚未处理任何体积时为 `None`.
    pub fn get_avg_seam_error(&self) -> Option<f64> {
        (self.volumes > 0).then(|| self.seam_err_sum / self.volumes as f64)
    }

    /// 精化修改的体素总数.
    pub fn get_refined(&self) -> u64 {
        self.refined_voxels
    }

    /// 单个体积的最长耗时.
    pub fn get_most_time_consuming(&self) -> Option<Duration> {
        self.most_time
    }
}

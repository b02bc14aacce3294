//! 程序运行函数.

use crate::result::AblationResult;
use std::thread;
use utils::loader;

/// 实际运行.
pub fn run() -> AblationResult {
    let volumes = loader::prob_volumes_or_synthetic(4);
    assert!(!volumes.is_empty(), "没有可用的实验体积");

    println!("Running blend ablation on {} volumes...", volumes.len());
    println!("Parallel cores: {}", utils::cpus());

    thread::scope(|s| {
        use super::algos::*;

        let vs = volumes.as_slice();
        let handles = [overwrite, average, linear_ramp].map(|t| s.spawn(move || t(vs)));

        AblationResult::from_iter(
            ["overwrite", "average", "linear-ramp"].into_iter().zip(
                handles
                    .into_iter()
                    .map(|th| th.join().expect("Thread joining error")),
            ),
        )
    })
}

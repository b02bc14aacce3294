//! 拼接融合模式消融实验入口.
//!
//! 在同一批概率体上分别以 overwrite / average / linear-ramp 三种融合
//! 模式重建全体积, 比较重建误差, 精化修改量与耗时.

mod algos;
mod result;
mod runner;

fn main() {
    simple_logger::SimpleLogger::new()
        .init()
        .expect("logger 初始化失败");

    let result = runner::run();
    result.analyze();
}

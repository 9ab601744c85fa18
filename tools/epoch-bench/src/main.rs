//! 按 json 配置构建数据模块, 迭代一轮训练集与验证集加载器并报告吞吐量.
//!
//! 用法: `epoch-bench [config.json]`. 未给出路径时依次查找
//! `$HCS_BENCH_CONFIG` 与 `$HOME/dataset/hcs_bench.json`.

use std::error::Error;

mod result;
mod runner;

fn main() -> Result<(), Box<dyn Error>> {
    utils::init_logger();
    let path = utils::loader::config_path_from_args_env_or_home()
        .ok_or("cannot locate a config file: pass a path or set $HCS_BENCH_CONFIG")?;
    let result = runner::run(&path)?;
    result.analyze()?;
    Ok(())
}

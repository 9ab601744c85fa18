//! 对 `hcs-window` 配置读取的更一层封装.

use std::env;
use std::path::{Path, PathBuf};

use hcs_window::error::StoreResult;
use hcs_window::store::home_dataset_dir_with;
use hcs_window::DataModuleConfig;

/// 配置文件路径的环境变量名.
pub const CONFIG_ENV: &str = "HCS_BENCH_CONFIG";

/// 获取数据模块配置文件路径.
///
/// 1. 若命令行给出了第一个参数, 则返回它;
/// 2. 否则, 若环境变量 `$HCS_BENCH_CONFIG` 非空, 则返回其值;
/// 3. 否则, 返回 `$HOME/dataset/hcs_bench.json`.
pub fn config_path_from_args_env_or_home() -> Option<PathBuf> {
    if let Some(p) = env::args_os().nth(1) {
        return Some(PathBuf::from(p));
    }
    match env::var(CONFIG_ENV) {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => home_dataset_dir_with(["hcs_bench.json"]),
    }
}

/// 读取数据模块配置.
#[inline]
pub fn load_config<P: AsRef<Path>>(path: P) -> StoreResult<DataModuleConfig> {
    DataModuleConfig::from_json_file(path)
}

//! 命令行工具依赖的通用组件.

use log::LevelFilter;

pub mod loader;

const SEP: &str = "--------------------------------------------------------";

/// 简单分隔线.
#[inline]
pub fn sep_to<W: std::io::Write>(mut w: W) -> std::io::Result<()> {
    writeln!(&mut w, "{SEP}")
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 安装终端 logger. `$RUST_LOG` 为 `debug` / `trace` 等合法级别时使用该级别, 否则为 `info`.
pub fn init_logger() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|l| l.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    // 重复安装时保留已有的 logger.
    let _ = simple_logger::SimpleLogger::new().with_level(level).init();
}

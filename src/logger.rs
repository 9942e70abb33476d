//! 日志初始化

use tracing_subscriber::EnvFilter;

/// 安装全局日志订阅者
///
/// 过滤规则取自 `RUST_LOG`，未设置时为 `info`。`verbose` 为真时默认级别降为 `debug`。
/// 重复调用是安全的。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

//! 可观测性：tracing 订阅器初始化
//!
//! 库代码只使用 tracing 宏，从不安装订阅器；由二进制入口调用 init。
//! 工具审计日志使用 target "tool"，可用 `RUST_LOG=tool=info` 单独打开。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，可通过 RUST_LOG 覆盖；重复调用时忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

//! 可观测性：tracing 初始化
//!
//! 默认 info 级别，可通过 RUST_LOG 覆盖；工具调用的 JSON 审计事件见 tools::client。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

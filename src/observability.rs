//! 可观测性：tracing 初始化与请求 ID

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().expect("static directive parses")))
        .with(fmt::layer())
        .init();
}

/// 生成新的请求 ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

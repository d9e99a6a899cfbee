//! 核心共享层：错误类型与 token 预算追踪

pub mod error;
pub mod tracker;

pub use error::AgentError;
pub use tracker::{TokenTracker, SOFT_BUDGET_RATIO};

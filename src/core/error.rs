//! Agent 错误类型
//!
//! 上游故障（搜索、抓取、LLM）在循环内部以日记叙事方式消化，不中断主循环；
//! 这里的错误类型只用于确实无法继续的场景（配置缺失、请求非法、流被关闭等）。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误（LLM、结构化输出、外部协作方、取消等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(String),

    /// LLM 连续多次未能输出符合 Schema 的 JSON
    #[error("Schema violation after retries: {0}")]
    SchemaViolation(String),

    #[error("Search failed: {0}")]
    Search(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Sandbox failed: {0}")]
    Sandbox(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(String),

    /// 响应流已被客户端关闭
    #[error("Stream closed by client")]
    StreamClosed,

    #[error("Cancelled")]
    Cancelled,
}

impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        AgentError::Llm(e.to_string())
    }
}

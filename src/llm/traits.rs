//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete 返回完成文本与本次
//! token 用量，供上层按工具计入预算。消息类型与 LLM API 的 role 语义一致。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 单次调用的 token 用量
#[derive(Clone, Copy, Debug, Default)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl LlmUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// 一次完成的结果：文本与用量
#[derive(Clone, Debug)]
pub struct LlmReply {
    pub content: String,
    pub usage: LlmUsage,
}

/// LLM 调用错误
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Empty completion")]
    EmptyCompletion,
}

/// LLM 客户端 trait：非流式完成，返回文本与用量
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<LlmReply, LlmError>;
}

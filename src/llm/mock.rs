//! 脚本化 Mock LLM 客户端（用于测试，无需 API）
//!
//! 按入队顺序回放预设回复并统计调用次数；脚本耗尽后回放最后一条，
//! 便于在测试中精确控制「下一步动作」与评估结果。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, LlmReply, LlmUsage, Message};

/// 脚本化客户端：replies 依次弹出；calls 记录总调用次数
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    calls: AtomicUsize,
    /// 每次调用计入的 token 数（测试预算耗尽场景时调大）
    tokens_per_call: u64,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            tokens_per_call: 100,
            ..Self::default()
        }
    }

    pub fn with_tokens_per_call(mut self, tokens: u64) -> Self {
        self.tokens_per_call = tokens;
        self
    }

    /// 追加一条脚本回复
    pub fn push(&self, reply: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(reply.into());
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _messages: &[Message]) -> Result<LlmReply, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .replies
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front());
        let content = match next {
            Some(reply) => {
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(reply.clone());
                }
                reply
            }
            None => self
                .last
                .lock()
                .ok()
                .and_then(|l| l.clone())
                .ok_or(LlmError::EmptyCompletion)?,
        };
        Ok(LlmReply {
            content,
            usage: LlmUsage {
                prompt_tokens: self.tokens_per_call / 2,
                completion_tokens: self.tokens_per_call - self.tokens_per_call / 2,
            },
        })
    }
}

//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 OpenAI、
//! DeepSeek、自建代理等。累计 token 用量用原子计数，供进程级指标读取。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, LlmReply, LlmUsage, Message, Role};

/// Token 用量统计（进程内累计值）
#[derive(Debug, Clone, Default)]
pub struct CumulativeUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl CumulativeUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时转 Message 为 API 格式并取首条 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: CumulativeUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: CumulativeUsage::default(),
        }
    }

    fn to_openai_messages(&self, messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap_or_default(),
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap_or_default(),
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap_or_default(),
                ),
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<LlmReply, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages))
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| LlmUsage {
                prompt_tokens: u.prompt_tokens as u64,
                completion_tokens: u.completion_tokens as u64,
            })
            .unwrap_or_default();
        self.usage.add(usage.prompt_tokens, usage.completion_tokens);

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::EmptyCompletion);
        }

        Ok(LlmReply { content, usage })
    }
}

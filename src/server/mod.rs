//! chat-completions HTTP 服务
//!
//! POST /v1/chat/completions：进核前做消息净化（剥离 assistant 的
//! <think> 片段、把 image_url 部件映射为 image 形式）与预算映射
//! （reasoning_effort → token 预算 / 否决次数，budget_tokens 与 max_attempts
//! 可覆盖）。流式模式按 SSE 吐 OpenAI 兼容 chunk：开头 <think> 标记、
//! 思考与 url chunk、thinking_end 收束、带 usage 与 URL 清单的终局 chunk。

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::TokenTracker;
use crate::knowledge::Reference;
use crate::llm::{LlmClient, Message};
use crate::research::{
    research_loop, ActionTracker, FinalReport, ResearchOptions, ResearchSession,
};
use crate::stream::{spawn_stream_channel, StreamChunk, TypingPacing};
use crate::tools::{LlmSandbox, PageReader, Reranker, SearchProvider, ToolSet};
use crate::urls::{HostPolicy, HARD_MAX_RETURNED_URLS};

/// 服务共享状态：LLM 与无状态协作方跨请求复用，沙箱按请求构造（挂请求预算）
pub struct AppState {
    pub llm: Arc<dyn LlmClient>,
    pub search: Arc<dyn SearchProvider>,
    pub reader: Arc<dyn PageReader>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub config: AppConfig,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub stream: bool,
    /// low / medium / high
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub max_completion_tokens: Option<u64>,
    #[serde(default)]
    pub budget_tokens: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub no_direct_answer: bool,
    #[serde(default)]
    pub max_returned_urls: Option<usize>,
    #[serde(default)]
    pub boost_hostnames: Vec<String>,
    #[serde(default)]
    pub bad_hostnames: Vec<String>,
    #[serde(default)]
    pub only_hostnames: Vec<String>,
}

/// 入站消息：content 允许纯文本或多部件数组
#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: Value,
}

/// reasoning_effort → (token 预算, 每准则否决次数)
pub fn budget_for(request: &ChatCompletionRequest) -> (u64, u32) {
    let effort = request.reasoning_effort.as_deref().unwrap_or("medium");
    let (default_budget, default_attempts) = match effort {
        "low" => (100_000, 1),
        "high" => (1_000_000, 2),
        _ => (500_000, 1),
    };
    let budget = request
        .budget_tokens
        .or(request.max_completion_tokens)
        .unwrap_or(default_budget);
    let attempts = request.max_attempts.unwrap_or(default_attempts);
    (budget, attempts)
}

/// 剥离 assistant 回合里的 <think>…</think> 片段
fn strip_think_spans(content: &str) -> String {
    let re = regex::Regex::new(r"(?s)<think>.*?</think>").expect("static regex parses");
    re.replace_all(content, "").trim().to_string()
}

/// 多部件 content 拍平：text 原样、image_url 映射为 image 形式
fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => part.get("text").and_then(|t| t.as_str()).map(String::from),
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|v| v.get("url").and_then(|u| u.as_str()).or(v.as_str()))?;
                        Some(json!({ "type": "image", "image": url }).to_string())
                    }
                    _ => None,
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// 入站消息净化为核内 Message
pub fn sanitize_messages(messages: &[IncomingMessage]) -> Vec<Message> {
    messages
        .iter()
        .filter_map(|m| {
            let content = flatten_content(&m.content);
            match m.role.as_str() {
                "user" => Some(Message::user(content)),
                "assistant" => Some(Message::assistant(strip_think_spans(&content))),
                "system" => Some(Message::system(content)),
                _ => None,
            }
        })
        .collect()
}

fn annotations_of(references: &[Reference]) -> Value {
    Value::Array(
        references
            .iter()
            .map(|r| {
                json!({
                    "type": "url_citation",
                    "url_citation": {
                        "title": r.title,
                        "exactQuote": r.exact_quote,
                        "url": r.url,
                        "dateTime": r.date_time,
                    }
                })
            })
            .collect(),
    )
}

/// 一次响应内共享的 chunk 元数据
#[derive(Clone)]
struct ChunkContext {
    id: String,
    model: String,
    created: i64,
}

impl ChunkContext {
    fn new(model: String) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model,
            created: chrono::Utc::now().timestamp(),
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "logprobs": null,
                "finish_reason": finish_reason,
            }],
        })
    }
}

fn sse_bytes(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

/// StreamChunk → SSE 帧
fn chunk_to_sse(chunk: &StreamChunk, ctx: &ChunkContext) -> Bytes {
    match chunk {
        StreamChunk::Think { text } => {
            sse_bytes(&ctx.chunk(json!({ "type": "think", "content": text }), None))
        }
        StreamChunk::Url { url } => sse_bytes(&ctx.chunk(
            json!({ "type": "think", "content": "", "url": url }),
            None,
        )),
        StreamChunk::ThinkingEnd => sse_bytes(&ctx.chunk(
            json!({ "type": "think", "content": "</think>\n\n" }),
            Some("thinking_end"),
        )),
        StreamChunk::Answer(report) => {
            let mut value = ctx.chunk(
                json!({
                    "type": "text",
                    "content": report.md_answer.as_ref().unwrap_or(&report.answer),
                    "annotations": annotations_of(&report.references),
                }),
                Some("stop"),
            );
            value["usage"] = json!({ "total_tokens": report.total_tokens, "budget_tokens": report.token_budget });
            value["visitedURLs"] = json!(report.visited_urls);
            value["readURLs"] = json!(report.read_urls);
            value["numURLs"] = json!(report.all_urls.len());
            sse_bytes(&value)
        }
        StreamChunk::Error { text } => sse_bytes(&ctx.chunk(
            json!({ "type": "error", "content": text }),
            Some("error"),
        )),
    }
}

/// 响应流被丢弃时取消调度循环（下一个循环边界生效)
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let request_id = crate::observability::generate_request_id();
    let conversation = sanitize_messages(&request.messages);
    if conversation.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(error_body("messages must not be empty")),
        )
            .into_response();
    }

    let (budget, max_attempts) = budget_for(&request);
    let tracker = Arc::new(TokenTracker::new(budget));
    let options = ResearchOptions {
        max_bad_attempts: max_attempts,
        no_direct_answer: request.no_direct_answer,
        max_returned_urls: request
            .max_returned_urls
            .unwrap_or(crate::urls::DEFAULT_MAX_RETURNED_URLS)
            .min(HARD_MAX_RETURNED_URLS),
        host_policy: HostPolicy {
            boost_hostnames: request.boost_hostnames.clone(),
            bad_hostnames: request.bad_hostnames.clone(),
            only_hostnames: request.only_hostnames.clone(),
        },
        step_sleep_ms: state.config.agent.step_sleep_ms,
        debug_dir: state.config.agent.debug_dir.clone(),
    };
    let tools = ToolSet {
        search: state.search.clone(),
        reader: state.reader.clone(),
        sandbox: Arc::new(LlmSandbox::new(state.llm.clone(), tracker.clone())),
        reranker: state.reranker.clone(),
    };
    let cancel = CancellationToken::new();
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.llm.model.clone());
    tracing::info!(request_id = %request_id, budget, stream = request.stream, "chat completion");

    if !request.stream {
        let session = ResearchSession {
            llm: state.llm.clone(),
            tools,
            tracker,
            actions: ActionTracker::detached(),
            cancel,
            options,
        };
        return match research_loop(&session, &conversation).await {
            Ok(report) => Json(completion_body(&report, &model)).into_response(),
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "research failed");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(error_body(&e.to_string())))
                    .into_response()
            }
        };
    }

    // 流式：调度循环与流式通道并行，响应体消费 StreamChunk
    let (actions, events) = ActionTracker::new();
    let session = ResearchSession {
        llm: state.llm.clone(),
        tools,
        tracker,
        actions,
        cancel: cancel.clone(),
        options,
    };
    let (tx, rx) = mpsc::channel::<StreamChunk>(64);
    let _channel = spawn_stream_channel(events, tx, TypingPacing::natural());
    tokio::spawn(async move {
        if let Err(e) = research_loop(&session, &conversation).await {
            tracing::error!(error = %e, "research failed");
            session.actions.publish_error(e.to_string());
        }
    });

    let ctx = ChunkContext::new(model);
    let opening = sse_bytes(&ctx.chunk(
        json!({ "role": "assistant", "type": "think", "content": "<think>" }),
        None,
    ));
    let guard = CancelOnDrop(cancel);
    let body_stream = futures_util::stream::unfold(
        (rx, ctx, Some(opening), guard),
        |(mut rx, ctx, opening, guard)| async move {
            if let Some(first) = opening {
                return Some((first, (rx, ctx, None, guard)));
            }
            match rx.recv().await {
                Some(chunk) => {
                    let bytes = chunk_to_sse(&chunk, &ctx);
                    Some((bytes, (rx, ctx, None, guard)))
                }
                None => None,
            }
        },
    )
    .chain(futures_util::stream::iter(vec![Bytes::from(
        "data: [DONE]\n\n",
    )]))
    .map(Ok::<Bytes, Infallible>);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn completion_body(report: &FinalReport, model: &str) -> Value {
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "type": "text",
                "content": report.md_answer.as_ref().unwrap_or(&report.answer),
                "annotations": annotations_of(&report.references),
            },
            "logprobs": null,
            "finish_reason": "stop",
        }],
        "usage": { "total_tokens": report.total_tokens, "budget_tokens": report.token_budget },
        "visitedURLs": report.visited_urls,
        "readURLs": report.read_urls,
        "numURLs": report.all_urls.len(),
    })
}

fn error_body(message: &str) -> Value {
    json!({
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "type": "error", "content": message },
            "finish_reason": "error",
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(effort: Option<&str>, budget: Option<u64>, attempts: Option<u32>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: None,
            messages: vec![],
            stream: false,
            reasoning_effort: effort.map(String::from),
            max_completion_tokens: None,
            budget_tokens: budget,
            max_attempts: attempts,
            no_direct_answer: false,
            max_returned_urls: None,
            boost_hostnames: vec![],
            bad_hostnames: vec![],
            only_hostnames: vec![],
        }
    }

    #[test]
    fn test_budget_mapping_per_effort() {
        assert_eq!(budget_for(&request_with(Some("low"), None, None)), (100_000, 1));
        assert_eq!(budget_for(&request_with(Some("medium"), None, None)), (500_000, 1));
        assert_eq!(budget_for(&request_with(Some("high"), None, None)), (1_000_000, 2));
        assert_eq!(budget_for(&request_with(None, None, None)), (500_000, 1));
    }

    #[test]
    fn test_budget_overrides() {
        assert_eq!(
            budget_for(&request_with(Some("high"), Some(42_000), Some(5))),
            (42_000, 5)
        );
        let mut req = request_with(Some("low"), None, None);
        req.max_completion_tokens = Some(7_000);
        assert_eq!(budget_for(&req), (7_000, 1));
    }

    #[test]
    fn test_strip_think_spans() {
        let content = "before <think>secret\nreasoning</think> after";
        assert_eq!(strip_think_spans(content), "before  after".trim());
    }

    #[test]
    fn test_sanitize_maps_image_parts() {
        let messages = vec![IncomingMessage {
            role: "user".to_string(),
            content: json!([
                { "type": "text", "text": "what is this?" },
                { "type": "image_url", "image_url": { "url": "https://img.example.com/x.png" } },
            ]),
        }];
        let sanitized = sanitize_messages(&messages);
        assert_eq!(sanitized.len(), 1);
        assert!(sanitized[0].content.contains("what is this?"));
        assert!(sanitized[0].content.contains("\"type\":\"image\""));
        assert!(sanitized[0].content.contains("https://img.example.com/x.png"));
    }

    #[test]
    fn test_annotations_shape() {
        let refs = vec![Reference {
            exact_quote: "quoted".to_string(),
            url: "https://example.com/a".to_string(),
            title: "A page".to_string(),
            date_time: Some("2026-01-01".to_string()),
        }];
        let ann = annotations_of(&refs);
        assert_eq!(ann[0]["type"], "url_citation");
        assert_eq!(ann[0]["url_citation"]["exactQuote"], "quoted");
        assert_eq!(ann[0]["url_citation"]["dateTime"], "2026-01-01");
    }
}

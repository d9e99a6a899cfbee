//! 外部协作方：搜索、页面抓取、代码沙箱、重排器
//!
//! 调度循环只依赖这里的 trait；具体实现（REST 搜索、reqwest 抓取、LLM 沙箱、
//! 词面重排）可整体替换。所有实现自带超时，失败以 AgentError 上抛，循环将其
//! 消化为日记叙事而不中断。

pub mod fetch;
pub mod mock;
pub mod rerank;
pub mod sandbox;
pub mod search;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

pub use fetch::HttpPageReader;
pub use mock::{StubReader, StubSandbox, StubSearch};
pub use rerank::LexicalReranker;
pub use sandbox::LlmSandbox;
pub use search::RestSearchProvider;

/// 一次搜索请求：关键词与可选的语言 / 地域 / 时间过滤
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    /// 语言码（如 en、zh）
    #[serde(default)]
    pub language: Option<String>,
    /// 国家码（如 us、cn）
    #[serde(default)]
    pub country: Option<String>,
    /// 时间过滤（如 qdr:d、qdr:w）
    #[serde(default)]
    pub time_filter: Option<String>,
}

impl SearchQuery {
    pub fn plain(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// 单条搜索结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub description: String,
    #[serde(default)]
    pub date: Option<String>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, AgentError>;
}

/// 抓取到的页面内容
#[derive(Clone, Debug, Default)]
pub struct PageContent {
    pub title: String,
    pub description: String,
    pub content: String,
    pub date: Option<String>,
    /// 页面内的 (anchor 文本, URL) 链接
    pub links: Vec<(String, String)>,
}

#[async_trait]
pub trait PageReader: Send + Sync {
    async fn read(&self, url: &str) -> Result<PageContent, AgentError>;

    /// 探测页面最后修改时间（HEAD 请求）；失败返回 None，不上抛
    async fn last_modified(&self, url: &str) -> Option<String>;
}

/// 代码沙箱的求解结果
#[derive(Clone, Debug)]
pub struct CodeSolution {
    pub code: String,
    pub output: String,
}

#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn solve(&self, issue: &str, context: &str) -> Result<CodeSolution, AgentError>;
}

/// 重排器：按与问题的相关度为候选 URL 打分；不可用时整体缺省为 0
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, question: &str, candidates: &[String]) -> Result<Vec<f32>, AgentError>;
}

/// 协作方集合，随请求传入调度循环
#[derive(Clone)]
pub struct ToolSet {
    pub search: Arc<dyn SearchProvider>,
    pub reader: Arc<dyn PageReader>,
    pub sandbox: Arc<dyn CodeSandbox>,
    pub reranker: Option<Arc<dyn Reranker>>,
}

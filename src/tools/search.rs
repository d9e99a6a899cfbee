//! REST 搜索提供方
//!
//! 对接 SERP 风格的 JSON 搜索 API：POST {q, hl, gl, tbs}，API Key 走请求头。
//! 自带超时；响应里的 organic 数组映射为 SearchHit。

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::core::AgentError;
use crate::tools::{SearchHit, SearchProvider, SearchQuery};

/// 单次搜索请求的默认超时（秒）
const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 30;
/// 每次搜索取回的结果数
const RESULTS_PER_QUERY: usize = 10;

#[derive(Debug, Deserialize)]
struct SerpResponse {
    #[serde(default)]
    organic: Vec<SerpEntry>,
}

#[derive(Debug, Deserialize)]
struct SerpEntry {
    #[serde(default)]
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    date: Option<String>,
}

/// SERP API 客户端：endpoint 与 api_key 来自配置
pub struct RestSearchProvider {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl RestSearchProvider {
    pub fn new(endpoint: &str, api_key: &str, timeout_secs: Option<u64>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(
                timeout_secs.unwrap_or(DEFAULT_SEARCH_TIMEOUT_SECS),
            ))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl SearchProvider for RestSearchProvider {
    fn name(&self) -> &'static str {
        "serp"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, AgentError> {
        let mut body = json!({
            "q": query.query,
            "num": RESULTS_PER_QUERY,
        });
        if let Some(hl) = &query.language {
            body["hl"] = json!(hl);
        }
        if let Some(gl) = &query.country {
            body["gl"] = json!(gl);
        }
        if let Some(tbs) = &query.time_filter {
            body["tbs"] = json!(tbs);
        }

        tracing::info!(query = %query.query, "search");
        let resp = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Search(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::Search(format!("HTTP {}", resp.status())));
        }
        let parsed: SerpResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::Search(format!("bad response body: {e}")))?;

        Ok(parsed
            .organic
            .into_iter()
            .map(|e| SearchHit {
                title: e.title,
                url: e.link,
                description: e.snippet,
                date: e.date,
            })
            .collect())
    }
}

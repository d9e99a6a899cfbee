//! Nectar 服务入口
//!
//! 启动: cargo run
//! POST http://127.0.0.1:3000/v1/chat/completions

use std::sync::Arc;

use nectar::config::load_config;
use nectar::llm::OpenAiClient;
use nectar::server::{router, AppState};
use nectar::tools::{HttpPageReader, LexicalReranker, RestSearchProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nectar::observability::init();

    let config = load_config(None).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config load failed, using defaults");
        Default::default()
    });

    let llm = Arc::new(OpenAiClient::new(
        config.llm.base_url.as_deref(),
        &config.llm.model,
        config.llm.api_key.as_deref(),
    ));
    let search_api_key = config
        .search
        .api_key
        .clone()
        .or_else(|| std::env::var("SERPER_API_KEY").ok())
        .unwrap_or_default();
    let search = Arc::new(RestSearchProvider::new(
        &config.search.endpoint,
        &search_api_key,
        Some(config.search.timeout_secs),
    ));
    let reader = Arc::new(HttpPageReader::new(
        Some(config.fetch.timeout_secs),
        Some(config.fetch.max_content_chars),
    ));

    let port = config.server.port;
    let state = Arc::new(AppState {
        llm,
        search,
        reader,
        reranker: Some(Arc::new(LexicalReranker)),
        config,
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("nectar listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

//! 测试用协作方桩：预置搜索结果与页面内容，记录调用次数

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::tools::{
    CodeSandbox, CodeSolution, PageContent, PageReader, SearchHit, SearchProvider, SearchQuery,
};

/// 桩搜索：所有查询返回同一组结果
#[derive(Debug, Default)]
pub struct StubSearch {
    hits: Mutex<Vec<SearchHit>>,
    pub calls: AtomicUsize,
}

impl StubSearch {
    pub fn with_hits(hits: Vec<SearchHit>) -> Self {
        Self {
            hits: Mutex::new(hits),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for StubSearch {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn search(&self, _query: &SearchQuery) -> Result<Vec<SearchHit>, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.lock().map(|h| h.clone()).unwrap_or_default())
    }
}

/// 桩抓取：按 URL 预置页面文本；未预置的 URL 返回抓取失败
#[derive(Debug, Default)]
pub struct StubReader {
    pages: Mutex<HashMap<String, String>>,
    pub calls: AtomicUsize,
}

impl StubReader {
    pub fn with_pages(pages: HashMap<String, String>) -> Self {
        Self {
            pages: Mutex::new(pages),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageReader for StubReader {
    async fn read(&self, url: &str) -> Result<PageContent, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self
            .pages
            .lock()
            .ok()
            .and_then(|p| p.get(url).cloned())
            .ok_or_else(|| AgentError::Fetch(format!("no stub page for {url}")))?;
        Ok(PageContent {
            title: format!("Title of {url}"),
            content,
            ..Default::default()
        })
    }

    async fn last_modified(&self, _url: &str) -> Option<String> {
        None
    }
}

/// 桩沙箱：回显 issue
#[derive(Debug, Default)]
pub struct StubSandbox;

#[async_trait]
impl CodeSandbox for StubSandbox {
    async fn solve(&self, issue: &str, _context: &str) -> Result<CodeSolution, AgentError> {
        Ok(CodeSolution {
            code: format!("// solve: {issue}"),
            output: format!("computed result for: {issue}"),
        })
    }
}

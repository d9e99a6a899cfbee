//! 页面抓取：GET 正文并抽取可读文本，HEAD 探测最后修改时间
//!
//! GET 请求带浏览器 UA 与常用请求头；HTML 响应用 html2text 提取可读文本，
//! 失败时退化为手工去标签。正文超过 max_content_chars 截断并追加 ...[truncated]。

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;

use crate::core::AgentError;
use crate::tools::{PageContent, PageReader};

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MAX_CONTENT_CHARS: usize = 40_000;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut prev_whitespace = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => {
                let is_whitespace = c.is_whitespace();
                if is_whitespace && prev_whitespace {
                    continue;
                }
                prev_whitespace = is_whitespace;
                out.push(if is_whitespace { ' ' } else { c });
            }
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.len() > 20
            && s.contains('<')
            && (s.contains("</") || s.contains("<meta") || s.contains("<head") || s.contains("<title")))
}

/// 从 HTML 中取 <title> 文本
fn extract_title(html: &str) -> String {
    let lower = html.to_lowercase();
    let Some(start) = lower.find("<title") else {
        return String::new();
    };
    let Some(open_end) = lower[start..].find('>') else {
        return String::new();
    };
    let body_start = start + open_end + 1;
    let Some(end) = lower[body_start..].find("</title>") else {
        return String::new();
    };
    html[body_start..body_start + end].trim().to_string()
}

/// 从 HTML 中取 meta description
fn extract_description(html: &str) -> String {
    let lower = html.to_lowercase();
    let Some(meta_pos) = lower.find("name=\"description\"") else {
        return String::new();
    };
    let tail = &html[meta_pos..];
    let Some(content_pos) = tail.to_lowercase().find("content=\"") else {
        return String::new();
    };
    let value = &tail[content_pos + 9..];
    value
        .find('"')
        .map(|end| value[..end].trim().to_string())
        .unwrap_or_default()
}

/// 抽取页面内链接 (anchor 文本, href)
fn extract_links(html: &str, base_url: &str) -> Vec<(String, String)> {
    let re = regex::Regex::new(r#"<a[^>]+href="([^"]+)"[^>]*>([^<]{0,120})</a>"#)
        .expect("static regex parses");
    let base = url::Url::parse(base_url).ok();
    re.captures_iter(html)
        .filter_map(|cap| {
            let href = cap.get(1)?.as_str();
            let text = cap.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
            let absolute = if href.starts_with("http://") || href.starts_with("https://") {
                href.to_string()
            } else {
                base.as_ref()?.join(href).ok()?.to_string()
            };
            Some((text, absolute))
        })
        .take(100)
        .collect()
}

/// reqwest 抓取器：超时与正文上限由配置决定
pub struct HttpPageReader {
    client: Client,
    max_content_chars: usize,
}

impl HttpPageReader {
    pub fn new(timeout_secs: Option<u64>, max_content_chars: Option<usize>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(
                timeout_secs.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ))
            .user_agent(USER_AGENT)
            .default_headers({
                use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE};
                let mut h = reqwest::header::HeaderMap::new();
                h.insert(
                    ACCEPT,
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
                        .parse()
                        .expect("static header parses"),
                );
                h.insert(
                    ACCEPT_LANGUAGE,
                    "en-US,en;q=0.9".parse().expect("static header parses"),
                );
                h
            })
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_content_chars: max_content_chars.unwrap_or(DEFAULT_MAX_CONTENT_CHARS),
        }
    }

    /// 将 HTML 转为可读文本（去除 script/style 等）
    fn html_to_text(&self, html: &str) -> String {
        let text = from_read(html.as_bytes(), 120);
        if !text.trim().is_empty() {
            text
        } else {
            strip_html_tags(html)
        }
    }
}

#[async_trait]
impl PageReader for HttpPageReader {
    async fn read(&self, url: &str) -> Result<PageContent, AgentError> {
        tracing::info!(url = %url, "fetch page");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::Fetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::Fetch(format!("HTTP {}", resp.status())));
        }
        let date = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let mut body = resp
            .text()
            .await
            .map_err(|e| AgentError::Fetch(format!("read body: {e}")))?;

        // 去除 BOM，避免 HTML 检测失败
        if body.starts_with('\u{FEFF}') {
            body = body[3..].to_string();
        }

        let (title, description, links, content) = if looks_like_html(&body) {
            (
                extract_title(&body),
                extract_description(&body),
                extract_links(&body, url),
                self.html_to_text(&body),
            )
        } else {
            (String::new(), String::new(), Vec::new(), body)
        };

        let content = if content.chars().count() > self.max_content_chars {
            content.chars().take(self.max_content_chars).collect::<String>() + "\n...[truncated]"
        } else {
            content
        };

        Ok(PageContent {
            title,
            description,
            content,
            date,
            links,
        })
    }

    async fn last_modified(&self, url: &str) -> Option<String> {
        let resp = self.client.head(url).send().await.ok()?;
        resp.headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html_tags() {
        let html = "<div><p>Hello   <b>world</b></p></div>";
        assert_eq!(strip_html_tags(html), "Hello world");
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html("<!DOCTYPE html><html><head></head></html>"));
        assert!(!looks_like_html("plain text response"));
    }

    #[test]
    fn test_extract_title_and_description() {
        let html = r#"<html><head><title> Page Title </title>
            <meta name="description" content="A short summary."></head></html>"#;
        assert_eq!(extract_title(html), "Page Title");
        assert_eq!(extract_description(html), "A short summary.");
    }

    #[test]
    fn test_extract_links_absolutizes_relative() {
        let html = r#"<a href="/docs">Docs</a> <a href="https://other.com/x">Other</a>"#;
        let links = extract_links(html, "https://example.com/base");
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].1, "https://example.com/docs");
        assert_eq!(links[1].1, "https://other.com/x");
    }
}

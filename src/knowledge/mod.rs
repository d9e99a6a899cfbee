//! 知识库：请求生命周期内只追加的 Q/A 条目
//!
//! 搜索摘要、页面阅读、子问题答案、代码结果与失败复盘都以「问题 → 答案」
//! 形式进入知识库，组 prompt 时整体铺成 Q/A 对。跨请求共享被明确禁止，
//! 以保证引用归属可靠。

use serde::{Deserialize, Serialize};

/// 引用：答案中的一条出处
#[derive(Clone, Debug, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Reference {
    /// 原文片段（逐字引用）
    #[serde(default)]
    pub exact_quote: String,
    /// 规范化后的 URL
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// 页面的最后修改时间（若探测到）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
}

/// 知识条目类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnowledgeKind {
    Qa,
    SideInfo,
    Url,
    Coding,
    ChatHistory,
}

/// 单条知识：问题、答案与可选的出处 / 源码
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub question: String,
    pub answer: String,
    pub kind: KnowledgeKind,
    #[serde(default)]
    pub references: Vec<Reference>,
    /// 条目写入时间（RFC 3339）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    /// coding 条目附带的源码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
}

impl KnowledgeItem {
    pub fn new(question: impl Into<String>, answer: impl Into<String>, kind: KnowledgeKind) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            kind,
            references: Vec::new(),
            updated: Some(chrono::Utc::now().to_rfc3339()),
            source_code: None,
        }
    }

    pub fn with_references(mut self, references: Vec<Reference>) -> Self {
        self.references = references;
        self
    }

    pub fn with_source_code(mut self, code: impl Into<String>) -> Self {
        self.source_code = Some(code.into());
        self
    }
}

/// 只追加的知识库
#[derive(Clone, Debug, Default)]
pub struct KnowledgeBase {
    items: Vec<KnowledgeItem>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: KnowledgeItem) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[KnowledgeItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 某 URL 的页面正文（若已读过），供引用核对
    pub fn page_content(&self, url: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|i| i.kind == KnowledgeKind::Url && i.references.iter().any(|r| r.url == url))
            .map(|i| i.answer.as_str())
    }

    /// 已成功阅读的 URL 列表（按写入顺序）
    pub fn read_urls(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| i.kind == KnowledgeKind::Url)
            .flat_map(|i| i.references.iter().map(|r| r.url.clone()))
            .collect()
    }

    /// 铺成 (问题, 答案) 对，供 prompt 组装
    pub fn qa_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items
            .iter()
            .map(|i| (i.question.as_str(), i.answer.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only_and_qa_pairs() {
        let mut kb = KnowledgeBase::new();
        kb.push(KnowledgeItem::new("q1", "a1", KnowledgeKind::SideInfo));
        kb.push(KnowledgeItem::new("q2", "a2", KnowledgeKind::Qa));

        assert_eq!(kb.len(), 2);
        let pairs: Vec<_> = kb.qa_pairs().collect();
        assert_eq!(pairs, vec![("q1", "a1"), ("q2", "a2")]);
    }

    #[test]
    fn test_page_content_lookup() {
        let mut kb = KnowledgeBase::new();
        let reference = Reference {
            url: "https://example.com/a".to_string(),
            ..Default::default()
        };
        kb.push(
            KnowledgeItem::new(
                "What is in https://example.com/a?",
                "full page text",
                KnowledgeKind::Url,
            )
            .with_references(vec![reference]),
        );

        assert_eq!(kb.page_content("https://example.com/a"), Some("full page text"));
        assert_eq!(kb.page_content("https://example.com/b"), None);
        assert_eq!(kb.read_urls(), vec!["https://example.com/a".to_string()]);
    }
}

//! 步骤动作：封闭和类型与按「当前允许动作」裁剪的 JSON Schema
//!
//! LLM 每步只能从 {search, visit, reflect, answer, coding} 中选一个动作；
//! 暴露给 LLM 的 Schema 在组 prompt 时按 AllowedActions 收窄为 oneOf 子集，
//! think 字段在所有动作上必填。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::knowledge::Reference;

/// 单步动作上限：一次最多执行的查询 / 访问 / 子问题数
pub const MAX_QUERIES_PER_STEP: usize = 5;
pub const MAX_URLS_PER_STEP: usize = 4;
pub const MAX_REFLECT_PER_STEP: usize = 3;

/// 动作种类（用于允许清单与日志）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Search,
    Visit,
    Reflect,
    Answer,
    Coding,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Search => "search",
            ActionKind::Visit => "visit",
            ActionKind::Reflect => "reflect",
            ActionKind::Answer => "answer",
            ActionKind::Coding => "coding",
        }
    }
}

/// LLM 每步返回的动作（内部标签 action 区分变体）
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum StepAction {
    Search {
        think: String,
        #[serde(default)]
        queries: Vec<String>,
    },
    Visit {
        think: String,
        /// 1 起始的下标，指向本步 prompt 展示的 URL 列表
        #[serde(default)]
        url_indices: Vec<usize>,
    },
    Reflect {
        think: String,
        #[serde(default)]
        sub_questions: Vec<String>,
    },
    Answer {
        think: String,
        answer: String,
        #[serde(default)]
        references: Vec<Reference>,
        #[serde(default)]
        md_answer: Option<String>,
    },
    Coding {
        think: String,
        issue: String,
    },
}

impl StepAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            StepAction::Search { .. } => ActionKind::Search,
            StepAction::Visit { .. } => ActionKind::Visit,
            StepAction::Reflect { .. } => ActionKind::Reflect,
            StepAction::Answer { .. } => ActionKind::Answer,
            StepAction::Coding { .. } => ActionKind::Coding,
        }
    }

    pub fn think(&self) -> &str {
        match self {
            StepAction::Search { think, .. }
            | StepAction::Visit { think, .. }
            | StepAction::Reflect { think, .. }
            | StepAction::Answer { think, .. }
            | StepAction::Coding { think, .. } => think,
        }
    }
}

/// 评估与收尾阶段流转的候选回答
#[derive(Clone, Debug)]
pub struct AnswerDraft {
    pub text: String,
    pub references: Vec<Reference>,
    pub md_answer: Option<String>,
    pub is_final: bool,
}

/// 当前允许的动作集合；每步派发后整体复位为全真，再由处理器按需关闭下一步
#[derive(Clone, Copy, Debug)]
pub struct AllowedActions {
    pub answer: bool,
    pub search: bool,
    pub visit: bool,
    pub reflect: bool,
    pub coding: bool,
}

impl Default for AllowedActions {
    fn default() -> Self {
        Self {
            answer: true,
            search: true,
            visit: true,
            reflect: true,
            coding: true,
        }
    }
}

impl AllowedActions {
    /// 收尾模式：只允许 answer
    pub fn answer_only() -> Self {
        Self {
            answer: true,
            search: false,
            visit: false,
            reflect: false,
            coding: false,
        }
    }

    pub fn allows(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::Answer => self.answer,
            ActionKind::Search => self.search,
            ActionKind::Visit => self.visit,
            ActionKind::Reflect => self.reflect,
            ActionKind::Coding => self.coding,
        }
    }

    pub fn enabled(&self) -> Vec<ActionKind> {
        [
            (ActionKind::Search, self.search),
            (ActionKind::Visit, self.visit),
            (ActionKind::Reflect, self.reflect),
            (ActionKind::Answer, self.answer),
            (ActionKind::Coding, self.coding),
        ]
        .into_iter()
        .filter_map(|(k, on)| on.then_some(k))
        .collect()
    }

    pub fn disable(&mut self, kind: ActionKind) {
        match kind {
            ActionKind::Answer => self.answer = false,
            ActionKind::Search => self.search = false,
            ActionKind::Visit => self.visit = false,
            ActionKind::Reflect => self.reflect = false,
            ActionKind::Coding => self.coding = false,
        }
    }
}

fn search_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "const": "search" },
            "think": { "type": "string", "description": "Why searching is the right next move" },
            "queries": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": MAX_QUERIES_PER_STEP,
                "description": "Distinct keyword queries, each covering a different angle"
            }
        },
        "required": ["action", "think", "queries"],
        "additionalProperties": false
    })
}

fn visit_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "const": "visit" },
            "think": { "type": "string", "description": "Why these pages are worth reading" },
            "url_indices": {
                "type": "array",
                "items": { "type": "integer", "minimum": 1 },
                "maxItems": MAX_URLS_PER_STEP,
                "description": "1-based indices into the URL list shown above"
            }
        },
        "required": ["action", "think", "url_indices"],
        "additionalProperties": false
    })
}

fn reflect_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "const": "reflect" },
            "think": { "type": "string", "description": "What knowledge gaps remain" },
            "sub_questions": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": MAX_REFLECT_PER_STEP,
                "description": "Self-contained sub-questions that close the gaps"
            }
        },
        "required": ["action", "think", "sub_questions"],
        "additionalProperties": false
    })
}

fn answer_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "const": "answer" },
            "think": { "type": "string", "description": "Why the knowledge gathered is sufficient" },
            "answer": { "type": "string", "description": "The complete answer to the question" },
            "references": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "exact_quote": { "type": "string", "description": "Verbatim quote from the source supporting the claim" },
                        "url": { "type": "string" },
                        "title": { "type": "string" }
                    },
                    "required": ["url"]
                }
            },
            "md_answer": { "type": "string", "description": "Optional markdown rendering of the answer" }
        },
        "required": ["action", "think", "answer", "references"],
        "additionalProperties": false
    })
}

fn coding_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "const": "coding" },
            "think": { "type": "string", "description": "Why this needs computation" },
            "issue": { "type": "string", "description": "Self-contained description of the coding problem" }
        },
        "required": ["action", "think", "issue"],
        "additionalProperties": false
    })
}

/// 按允许动作收窄的步骤 Schema（oneOf 子集）
pub fn action_schema(allowed: &AllowedActions) -> Value {
    let variants: Vec<Value> = allowed
        .enabled()
        .into_iter()
        .map(|k| match k {
            ActionKind::Search => search_schema(),
            ActionKind::Visit => visit_schema(),
            ActionKind::Reflect => reflect_schema(),
            ActionKind::Answer => answer_schema(),
            ActionKind::Coding => coding_schema(),
        })
        .collect();
    json!({ "oneOf": variants })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_action() {
        let raw = r#"{"action":"search","think":"need sources","queries":["rust async"]}"#;
        let action: StepAction = serde_json::from_str(raw).unwrap();
        assert_eq!(action.kind(), ActionKind::Search);
        assert_eq!(action.think(), "need sources");
    }

    #[test]
    fn test_parse_answer_action_with_references() {
        let raw = r#"{
            "action": "answer",
            "think": "enough evidence",
            "answer": "It is 42.",
            "references": [{"url": "https://example.com/a", "exact_quote": "the answer is 42"}]
        }"#;
        let action: StepAction = serde_json::from_str(raw).unwrap();
        match action {
            StepAction::Answer { references, .. } => {
                assert_eq!(references.len(), 1);
                assert_eq!(references[0].url, "https://example.com/a");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_schema_narrowing_excludes_disabled() {
        let mut allowed = AllowedActions::default();
        allowed.answer = false;
        allowed.reflect = false;
        let schema = action_schema(&allowed);
        let text = schema.to_string();
        assert!(text.contains("\"search\""));
        assert!(text.contains("\"visit\""));
        assert!(!text.contains("\"reflect\""));
        assert!(!text.contains("\"md_answer\""));
    }

    #[test]
    fn test_answer_only_mode() {
        let allowed = AllowedActions::answer_only();
        assert_eq!(allowed.enabled(), vec![ActionKind::Answer]);
    }
}

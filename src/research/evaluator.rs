//! 回答评估器：多准则短路判定与失败复盘
//!
//! 准则按 {definitive, freshness, plurality, attribution, completeness, strict}
//! 顺序逐项检查，首个不通过的准则即为结论，后续准则不再调用。每项准则是一次
//! 独立的 LLM 调用，各自约束在自己的 Schema 上。原始问题的准则集在首轮由一次
//! 选择调用确定，strict 无条件追加；子问题准则集为空（即无条件通过）。

use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::core::{AgentError, TokenTracker};
use crate::knowledge::KnowledgeBase;
use crate::llm::{generate_object, schema_of, LlmClient, Message};
use crate::research::actions::AnswerDraft;

/// 评估准则种类，声明顺序即检查顺序
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CriterionKind {
    Definitive,
    Freshness,
    Plurality,
    Attribution,
    Completeness,
    Strict,
}

impl CriterionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriterionKind::Definitive => "definitive",
            CriterionKind::Freshness => "freshness",
            CriterionKind::Plurality => "plurality",
            CriterionKind::Attribution => "attribution",
            CriterionKind::Completeness => "completeness",
            CriterionKind::Strict => "strict",
        }
    }

    fn order(&self) -> usize {
        match self {
            CriterionKind::Definitive => 0,
            CriterionKind::Freshness => 1,
            CriterionKind::Plurality => 2,
            CriterionKind::Attribution => 3,
            CriterionKind::Completeness => 4,
            CriterionKind::Strict => 5,
        }
    }
}

/// 单条准则与剩余尝试次数；归零时从准则集中移除
#[derive(Clone, Debug)]
pub struct Criterion {
    pub kind: CriterionKind,
    pub remaining_attempts: u32,
}

/// 一次评估的结论
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub pass: bool,
    /// 触发失败的准则（通过时为 None）
    pub kind: Option<CriterionKind>,
    pub think: String,
    /// strict 失败时的改进计划
    pub improvement_plan: Option<String>,
}

impl Evaluation {
    fn passed() -> Self {
        Self {
            pass: true,
            kind: None,
            think: String::new(),
            improvement_plan: None,
        }
    }
}

/// 失败复盘：概括、归因与改进建议
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct ErrorAnalysis {
    /// 此前步骤的简要概括
    pub recap: String,
    /// 失败的根因归属
    pub blame: String,
    /// 下一轮的改进方向
    pub improvement: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CriteriaChoice {
    think: String,
    needs_definitive: bool,
    needs_freshness: bool,
    needs_plurality: bool,
    needs_attribution: bool,
    needs_completeness: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DefinitiveVerdict {
    think: String,
    pass: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FreshnessVerdict {
    think: String,
    pass: bool,
    /// 最旧的承重来源距今天数
    days_ago: Option<u32>,
    /// 该问题隐含的最大可接受天数
    max_age_days: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PluralityVerdict {
    think: String,
    pass: bool,
    count_required: Option<u32>,
    count_provided: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AttributionVerdict {
    think: String,
    pass: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CompletenessVerdict {
    think: String,
    pass: bool,
    aspects_expected: Option<String>,
    aspects_provided: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct StrictVerdict {
    think: String,
    pass: bool,
    /// 不通过时必须给出的改进计划
    improvement_plan: Option<String>,
}

/// 评估器：持有 LLM 与预算追踪器，无状态可跨步复用
pub struct Evaluator {
    llm: Arc<dyn LlmClient>,
    tracker: Arc<TokenTracker>,
}

impl Evaluator {
    pub fn new(llm: Arc<dyn LlmClient>, tracker: Arc<TokenTracker>) -> Self {
        Self { llm, tracker }
    }

    /// 为原始问题选择准则子集；strict 无条件追加，每项给满尝试次数
    pub async fn select_criteria(
        &self,
        question: &str,
        max_attempts: u32,
    ) -> Result<Vec<Criterion>, AgentError> {
        let system = format!(
            "You are a research question analyst. Decide which quality checks a good answer \
             to the question must pass.\n\
             - definitive: the question expects a committed answer, not \"it depends\"\n\
             - freshness: the question implies recency (news, prices, versions, \"latest\")\n\
             - plurality: the question asks for a specific number or list of items\n\
             - attribution: the question demands verifiable sources\n\
             - completeness: the question names multiple aspects that all must be covered\n\
             Current date: {}",
            chrono::Utc::now().format("%Y-%m-%d")
        );
        let schema = schema_of::<CriteriaChoice>();
        let choice: CriteriaChoice = generate_object(
            self.llm.as_ref(),
            &self.tracker,
            "evaluator",
            &system,
            &[Message::user(question)],
            &schema,
        )
        .await?;
        tracing::debug!(question = %question, think = %choice.think, "criteria selected");

        let mut criteria = Vec::new();
        let mut push = |kind: CriterionKind, on: bool| {
            if on {
                criteria.push(Criterion {
                    kind,
                    remaining_attempts: max_attempts,
                });
            }
        };
        push(CriterionKind::Definitive, choice.needs_definitive);
        push(CriterionKind::Freshness, choice.needs_freshness);
        push(CriterionKind::Plurality, choice.needs_plurality);
        push(CriterionKind::Attribution, choice.needs_attribution);
        push(CriterionKind::Completeness, choice.needs_completeness);
        push(CriterionKind::Strict, true);
        Ok(criteria)
    }

    /// 按固定顺序短路评估；准则集为空时直接通过
    pub async fn evaluate(
        &self,
        question: &str,
        answer: &AnswerDraft,
        criteria: &[Criterion],
        knowledge: &KnowledgeBase,
    ) -> Result<Evaluation, AgentError> {
        let mut ordered: Vec<&Criterion> = criteria.iter().collect();
        ordered.sort_by_key(|c| c.kind.order());

        for criterion in ordered {
            let verdict = match criterion.kind {
                CriterionKind::Definitive => self.check_definitive(question, answer).await?,
                CriterionKind::Freshness => self.check_freshness(question, answer).await?,
                CriterionKind::Plurality => self.check_plurality(question, answer).await?,
                CriterionKind::Attribution => {
                    self.check_attribution(question, answer, knowledge).await?
                }
                CriterionKind::Completeness => self.check_completeness(question, answer).await?,
                CriterionKind::Strict => self.check_strict(question, answer).await?,
            };
            if !verdict.pass {
                tracing::info!(
                    criterion = criterion.kind.as_str(),
                    think = %verdict.think,
                    "answer rejected"
                );
                return Ok(verdict);
            }
        }
        Ok(Evaluation::passed())
    }

    /// 失败复盘：给出 recap / blame / improvement，推入知识库供下一轮参考
    pub async fn analyze_failure(
        &self,
        question: &str,
        diary: &[String],
        critique: &str,
    ) -> Result<ErrorAnalysis, AgentError> {
        let system = "You are reviewing a failed research attempt. Summarize what was tried, \
                      identify the single root cause of the failure, and propose a concretely \
                      different strategy for the next attempt.";
        let context = format!(
            "Question: {question}\n\nSteps taken:\n{}\n\nReviewer critique: {critique}",
            diary.join("\n")
        );
        let schema = schema_of::<ErrorAnalysis>();
        generate_object(
            self.llm.as_ref(),
            &self.tracker,
            "evaluator",
            system,
            &[Message::user(context)],
            &schema,
        )
        .await
    }

    fn answer_block(question: &str, answer: &AnswerDraft) -> String {
        let refs = answer
            .references
            .iter()
            .map(|r| format!("- {} ({}) \"{}\"", r.url, r.date_time.as_deref().unwrap_or("undated"), r.exact_quote))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Question: {question}\n\nCandidate answer:\n{}\n\nReferences:\n{}",
            answer.text,
            if refs.is_empty() { "(none)" } else { refs.as_str() }
        )
    }

    async fn check_definitive(
        &self,
        question: &str,
        answer: &AnswerDraft,
    ) -> Result<Evaluation, AgentError> {
        let system = "Judge whether the candidate answer commits to a definitive position. \
                      Answers shaped like \"I don't know\", \"it is unclear\" or that merely \
                      restate the question fail this check.";
        let schema = schema_of::<DefinitiveVerdict>();
        let v: DefinitiveVerdict = generate_object(
            self.llm.as_ref(),
            &self.tracker,
            "evaluator",
            system,
            &[Message::user(Self::answer_block(question, answer))],
            &schema,
        )
        .await?;
        Ok(Evaluation {
            pass: v.pass,
            kind: Some(CriterionKind::Definitive),
            think: v.think,
            improvement_plan: None,
        })
    }

    async fn check_freshness(
        &self,
        question: &str,
        answer: &AnswerDraft,
    ) -> Result<Evaluation, AgentError> {
        let system = format!(
            "The question implies recency. Judge whether every load-bearing claim in the \
             candidate answer is supported by a source no older than the question's implied \
             window. Report the age of the oldest load-bearing source as days_ago and the \
             implied window as max_age_days. Current date: {}",
            chrono::Utc::now().format("%Y-%m-%d")
        );
        let schema = schema_of::<FreshnessVerdict>();
        let v: FreshnessVerdict = generate_object(
            self.llm.as_ref(),
            &self.tracker,
            "evaluator",
            &system,
            &[Message::user(Self::answer_block(question, answer))],
            &schema,
        )
        .await?;
        let think = match (v.days_ago, v.max_age_days) {
            (Some(days), Some(max)) if !v.pass => {
                format!("{} (source is {days} days old, window is {max} days)", v.think)
            }
            _ => v.think,
        };
        Ok(Evaluation {
            pass: v.pass,
            kind: Some(CriterionKind::Freshness),
            think,
            improvement_plan: None,
        })
    }

    async fn check_plurality(
        &self,
        question: &str,
        answer: &AnswerDraft,
    ) -> Result<Evaluation, AgentError> {
        let system = "The question asks for a specific number of items. Count how many the \
                      candidate answer actually provides and judge whether it meets the \
                      requested count.";
        let schema = schema_of::<PluralityVerdict>();
        let v: PluralityVerdict = generate_object(
            self.llm.as_ref(),
            &self.tracker,
            "evaluator",
            system,
            &[Message::user(Self::answer_block(question, answer))],
            &schema,
        )
        .await?;
        let think = match (v.count_required, v.count_provided) {
            (Some(required), Some(provided)) if !v.pass => {
                format!("{} (needs {required}, provides {provided})", v.think)
            }
            _ => v.think,
        };
        Ok(Evaluation {
            pass: v.pass,
            kind: Some(CriterionKind::Plurality),
            think,
            improvement_plan: None,
        })
    }

    async fn check_attribution(
        &self,
        question: &str,
        answer: &AnswerDraft,
        knowledge: &KnowledgeBase,
    ) -> Result<Evaluation, AgentError> {
        // 代码侧预检：逐字引用必须真的出现在已抓取的页面文本里
        for reference in &answer.references {
            if reference.exact_quote.trim().is_empty() {
                continue;
            }
            if let Some(content) = knowledge.page_content(&reference.url) {
                if !contains_normalized(content, &reference.exact_quote) {
                    return Ok(Evaluation {
                        pass: false,
                        kind: Some(CriterionKind::Attribution),
                        think: format!(
                            "quote \"{}\" does not appear in the fetched text of {}",
                            reference.exact_quote, reference.url
                        ),
                        improvement_plan: None,
                    });
                }
            }
        }

        let sources = answer
            .references
            .iter()
            .filter_map(|r| knowledge.page_content(&r.url).map(|c| (r.url.as_str(), c)))
            .map(|(url, content)| {
                let preview: String = content.chars().take(2000).collect();
                format!("### {url}\n{preview}")
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let system = "Judge whether every factual claim in the candidate answer is backed by \
                      one of its references, using the fetched source excerpts below. Claims \
                      with no supporting source fail this check.";
        let schema = schema_of::<AttributionVerdict>();
        let v: AttributionVerdict = generate_object(
            self.llm.as_ref(),
            &self.tracker,
            "evaluator",
            system,
            &[Message::user(format!(
                "{}\n\nFetched sources:\n{}",
                Self::answer_block(question, answer),
                if sources.is_empty() { "(none fetched)" } else { sources.as_str() }
            ))],
            &schema,
        )
        .await?;
        Ok(Evaluation {
            pass: v.pass,
            kind: Some(CriterionKind::Attribution),
            think: v.think,
            improvement_plan: None,
        })
    }

    async fn check_completeness(
        &self,
        question: &str,
        answer: &AnswerDraft,
    ) -> Result<Evaluation, AgentError> {
        let system = "The question names multiple explicit aspects. List the aspects the \
                      question expects and the aspects the candidate answer actually covers, \
                      then judge whether all expected aspects are addressed.";
        let schema = schema_of::<CompletenessVerdict>();
        let v: CompletenessVerdict = generate_object(
            self.llm.as_ref(),
            &self.tracker,
            "evaluator",
            system,
            &[Message::user(Self::answer_block(question, answer))],
            &schema,
        )
        .await?;
        let think = match (&v.aspects_expected, &v.aspects_provided) {
            (Some(expected), Some(provided)) if !v.pass => {
                format!("{} (expected: {expected}; provided: {provided})", v.think)
            }
            _ => v.think,
        };
        Ok(Evaluation {
            pass: v.pass,
            kind: Some(CriterionKind::Completeness),
            think,
            improvement_plan: None,
        })
    }

    async fn check_strict(
        &self,
        question: &str,
        answer: &AnswerDraft,
    ) -> Result<Evaluation, AgentError> {
        let system = "You are a demanding reviewer. Look for any remaining weakness in the \
                      candidate answer: vagueness, missing caveats, unsupported jumps, poor \
                      structure. If you reject it, provide a concrete improvement_plan.";
        let schema = schema_of::<StrictVerdict>();
        let v: StrictVerdict = generate_object(
            self.llm.as_ref(),
            &self.tracker,
            "evaluator",
            system,
            &[Message::user(Self::answer_block(question, answer))],
            &schema,
        )
        .await?;
        Ok(Evaluation {
            pass: v.pass,
            kind: Some(CriterionKind::Strict),
            think: v.think,
            improvement_plan: v.improvement_plan,
        })
    }
}

/// 宽松包含：大小写不敏感、空白折叠后的子串检查
fn contains_normalized(haystack: &str, needle: &str) -> bool {
    let norm = |s: &str| {
        s.to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    };
    norm(haystack).contains(&norm(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;

    fn draft(text: &str) -> AnswerDraft {
        AnswerDraft {
            text: text.to_string(),
            references: Vec::new(),
            md_answer: None,
            is_final: false,
        }
    }

    #[test]
    fn test_contains_normalized() {
        assert!(contains_normalized("The  Quick\nBrown Fox", "quick brown"));
        assert!(!contains_normalized("something else", "quick brown"));
    }

    #[tokio::test]
    async fn test_empty_criteria_passes() {
        let llm = Arc::new(ScriptedLlm::new());
        let tracker = Arc::new(TokenTracker::new(10_000));
        let evaluator = Evaluator::new(llm.clone(), tracker);

        let result = evaluator
            .evaluate("sub question", &draft("an answer"), &[], &KnowledgeBase::new())
            .await
            .unwrap();
        assert!(result.pass);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_short_circuit_stops_at_first_failure() {
        let llm = Arc::new(ScriptedLlm::new());
        // definitive 失败后不得再调用 completeness / strict
        llm.push(r#"{"think": "hedges everywhere", "pass": false}"#);
        let tracker = Arc::new(TokenTracker::new(100_000));
        let evaluator = Evaluator::new(llm.clone(), tracker);

        let criteria = vec![
            Criterion { kind: CriterionKind::Strict, remaining_attempts: 1 },
            Criterion { kind: CriterionKind::Definitive, remaining_attempts: 1 },
            Criterion { kind: CriterionKind::Completeness, remaining_attempts: 1 },
        ];
        let result = evaluator
            .evaluate("q", &draft("maybe, it depends"), &criteria, &KnowledgeBase::new())
            .await
            .unwrap();
        assert!(!result.pass);
        assert_eq!(result.kind, Some(CriterionKind::Definitive));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_criteria_pass_in_order() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(r#"{"think": "committed", "pass": true}"#);
        llm.push(r#"{"think": "solid", "pass": true, "improvement_plan": null}"#);
        let tracker = Arc::new(TokenTracker::new(100_000));
        let evaluator = Evaluator::new(llm.clone(), tracker);

        let criteria = vec![
            Criterion { kind: CriterionKind::Definitive, remaining_attempts: 1 },
            Criterion { kind: CriterionKind::Strict, remaining_attempts: 1 },
        ];
        let result = evaluator
            .evaluate("q", &draft("firm answer"), &criteria, &KnowledgeBase::new())
            .await
            .unwrap();
        assert!(result.pass);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_attribution_precheck_rejects_fabricated_quote() {
        let llm = Arc::new(ScriptedLlm::new());
        let tracker = Arc::new(TokenTracker::new(100_000));
        let evaluator = Evaluator::new(llm.clone(), tracker);

        let mut knowledge = KnowledgeBase::new();
        knowledge.push(
            crate::knowledge::KnowledgeItem::new(
                "What is in https://example.com/a?",
                "the page talks about apples only",
                crate::knowledge::KnowledgeKind::Url,
            )
            .with_references(vec![crate::knowledge::Reference {
                url: "https://example.com/a".to_string(),
                ..Default::default()
            }]),
        );

        let mut answer = draft("bananas are blue");
        answer.references.push(crate::knowledge::Reference {
            url: "https://example.com/a".to_string(),
            exact_quote: "bananas are blue".to_string(),
            ..Default::default()
        });

        let criteria = vec![Criterion {
            kind: CriterionKind::Attribution,
            remaining_attempts: 1,
        }];
        let result = evaluator
            .evaluate("q", &answer, &criteria, &knowledge)
            .await
            .unwrap();
        assert!(!result.pass);
        assert_eq!(result.kind, Some(CriterionKind::Attribution));
        // 代码侧预检直接判负，无需 LLM 调用
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_strict_failure_carries_improvement_plan() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(r#"{"think": "too shallow", "pass": false, "improvement_plan": "add primary sources"}"#);
        let tracker = Arc::new(TokenTracker::new(100_000));
        let evaluator = Evaluator::new(llm.clone(), tracker);

        let criteria = vec![Criterion {
            kind: CriterionKind::Strict,
            remaining_attempts: 2,
        }];
        let result = evaluator
            .evaluate("q", &draft("short"), &criteria, &KnowledgeBase::new())
            .await
            .unwrap();
        assert_eq!(result.improvement_plan.as_deref(), Some("add primary sources"));
    }
}

//! 研究循环集成测试
//!
//! 用脚本化 LLM 与桩协作方驱动完整循环：寒暄直答、freshness 首步封锁、
//! 子问题分解、预算耗尽后的强制收尾、访问-引用-接受全链路。

use std::collections::HashMap;
use std::sync::Arc;

use nectar::core::TokenTracker;
use nectar::llm::{LlmClient, Message, ScriptedLlm};
use nectar::research::{research_loop, ActionTracker, ResearchOptions, ResearchSession};
use nectar::tools::{SearchHit, StubReader, StubSandbox, StubSearch, ToolSet};
use nectar::urls::HostPolicy;
use tokio_util::sync::CancellationToken;

fn make_session(
    llm: Arc<ScriptedLlm>,
    search: Arc<StubSearch>,
    reader: Arc<StubReader>,
    budget: u64,
    host_policy: HostPolicy,
) -> ResearchSession {
    let tracker = Arc::new(TokenTracker::new(budget));
    ResearchSession {
        llm: llm as Arc<dyn LlmClient>,
        tools: ToolSet {
            search,
            reader,
            sandbox: Arc::new(StubSandbox),
            reranker: None,
        },
        tracker,
        actions: ActionTracker::detached(),
        cancel: CancellationToken::new(),
        options: ResearchOptions {
            host_policy,
            ..Default::default()
        },
    }
}

fn no_criteria() -> &'static str {
    r#"{"think":"plain question","needs_definitive":false,"needs_freshness":false,
        "needs_plurality":false,"needs_attribution":false,"needs_completeness":false}"#
}

#[tokio::test]
async fn test_greeting_gets_trivial_answer_without_tools() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(no_criteria());
    llm.push(r#"{"action":"answer","think":"just a greeting","answer":"Hi there! How can I help?","references":[]}"#);
    let search = Arc::new(StubSearch::default());
    let reader = Arc::new(StubReader::default());

    let session = make_session(llm.clone(), search.clone(), reader.clone(), 100_000, HostPolicy::default());
    let report = research_loop(&session, &[Message::user("hi")]).await.unwrap();

    assert_eq!(report.answer, "Hi there! How can I help?");
    assert!(report.references.is_empty());
    assert!(report.visited_urls.is_empty());
    // 准则选择 + 一次动作决策，未动任何工具
    assert_eq!(llm.calls(), 2);
    assert_eq!(search.calls(), 0);
    assert_eq!(reader.calls(), 0);
}

#[tokio::test]
async fn test_freshness_lockout_forces_search_before_answer() {
    let llm = Arc::new(ScriptedLlm::new());
    // freshness 准则 → 第一步禁 answer/reflect
    llm.push(r#"{"think":"asks for today's story","needs_definitive":true,"needs_freshness":true,
        "needs_plurality":false,"needs_attribution":false,"needs_completeness":false}"#);
    // 第一步仍试图直答：应被拦下，不得成为终局
    llm.push(r#"{"action":"answer","think":"I will just answer","answer":"premature","references":[]}"#);
    // 第二步搜索
    llm.push(r#"{"action":"search","think":"must check the news first","queries":["top story example.com"]}"#);
    // 查询重写：无更好主意
    llm.push(r#"{"think":"queries are fine","queries":[]}"#);
    // 预算耗尽后的强制收尾
    llm.push(r#"{"action":"answer","think":"deadline","answer":"forced with evidence","references":[]}"#);

    let search = Arc::new(StubSearch::with_hits(vec![SearchHit {
        title: "Top story".to_string(),
        url: "https://example.com/news/today".to_string(),
        description: "Today's headline".to_string(),
        date: None,
    }]));
    let reader = Arc::new(StubReader::default());

    // 预算卡在两轮之后：100/次 × 4 次 > 460 × 0.85
    let session = make_session(llm.clone(), search.clone(), reader, 460, HostPolicy {
        boost_hostnames: vec!["example.com".to_string()],
        ..Default::default()
    });
    let report = research_loop(
        &session,
        &[Message::user("What is today's top story on example.com?")],
    )
    .await
    .unwrap();

    // 直答被封锁，最终来自强制收尾而非第一步的 premature
    assert_eq!(report.answer, "forced with evidence");
    assert_eq!(search.calls(), 1);
    assert_eq!(llm.calls(), 5);
    assert!(report.all_urls.iter().any(|u| u.contains("example.com")));
}

#[tokio::test]
async fn test_reflect_decomposes_then_each_sub_question_is_answered() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(r#"{"think":"compound question","needs_definitive":true,"needs_freshness":false,
        "needs_plurality":false,"needs_attribution":false,"needs_completeness":false}"#);
    llm.push(r#"{"action":"reflect","think":"two unknowns here","sub_questions":["sub one","sub two"]}"#);
    // 轮转：total_step=2, gaps=[orig, sub one, sub two] → sub two
    llm.push(r#"{"action":"answer","think":"easy","answer":"answer to sub two","references":[]}"#);
    // total_step=3, gaps=[orig, sub one] → sub one
    llm.push(r#"{"action":"answer","think":"easy","answer":"answer to sub one","references":[]}"#);
    // total_step=4 → 原始问题；definitive + strict 依次通过
    llm.push(r#"{"action":"answer","think":"both parts known","answer":"combined final answer","references":[]}"#);
    llm.push(r#"{"think":"committed","pass":true}"#);
    llm.push(r#"{"think":"well grounded","pass":true,"improvement_plan":null}"#);

    let session = make_session(
        llm.clone(),
        Arc::new(StubSearch::default()),
        Arc::new(StubReader::default()),
        100_000,
        HostPolicy::default(),
    );
    let report = research_loop(
        &session,
        &[Message::user("Compare A and B across two dimensions")],
    )
    .await
    .unwrap();

    assert_eq!(report.answer, "combined final answer");
    // 7 次调用：准则 + reflect + 两个子答案 + 终答 + 两次评估；子问题评估零调用
    assert_eq!(llm.calls(), 7);
}

#[tokio::test]
async fn test_budget_exhaustion_triggers_exactly_one_forced_answer() {
    let llm = Arc::new(ScriptedLlm::new().with_tokens_per_call(60_000));
    llm.push(no_criteria());
    llm.push(r#"{"action":"search","think":"look around","queries":["anything"]}"#);
    llm.push(r#"{"action":"answer","think":"deadline","answer":"forced","references":[]}"#);

    let search = Arc::new(StubSearch::default());
    let session = make_session(
        llm.clone(),
        search.clone(),
        Arc::new(StubReader::default()),
        100_000,
        HostPolicy::default(),
    );
    let report = research_loop(&session, &[Message::user("hard question")]).await.unwrap();

    assert_eq!(report.answer, "forced");
    // 循环两轮后预算越线，恰好一次收尾调用
    assert_eq!(llm.calls(), 3);
    // 超支允许，但被 15% 预留约束在预算之上的有限范围内
    assert!(report.total_tokens > report.token_budget);
    assert_eq!(report.total_tokens, 180_000);
}

#[tokio::test]
async fn test_visit_then_cited_answer_is_accepted() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(no_criteria());
    llm.push(r#"{"action":"search","think":"find docs","queries":["rust runtime"]}"#);
    llm.push(r#"{"think":"good enough","queries":[]}"#);
    llm.push(r#"{"action":"visit","think":"read the doc page","url_indices":[1]}"#);
    llm.push(r#"{"action":"answer","think":"page read","answer":"The runtime is multi-threaded.",
        "references":[{"url":"https://docs.example.com/rust","exact_quote":"the runtime is multi-threaded"}]}"#);
    // strict 通过
    llm.push(r#"{"think":"cited and exact","pass":true,"improvement_plan":null}"#);

    let search = Arc::new(StubSearch::with_hits(vec![SearchHit {
        title: "Rust runtime docs".to_string(),
        url: "https://docs.example.com/rust".to_string(),
        description: "Official docs".to_string(),
        date: None,
    }]));
    let mut pages = HashMap::new();
    pages.insert(
        "https://docs.example.com/rust".to_string(),
        "Overview: the runtime is multi-threaded and work-stealing.".to_string(),
    );
    let reader = Arc::new(StubReader::with_pages(pages));

    let session = make_session(llm.clone(), search, reader.clone(), 100_000, HostPolicy::default());
    let report = research_loop(&session, &[Message::user("Is the runtime multi-threaded?")])
        .await
        .unwrap();

    assert_eq!(report.answer, "The runtime is multi-threaded.");
    assert_eq!(reader.calls(), 1);
    assert_eq!(report.read_urls, vec!["https://docs.example.com/rust".to_string()]);
    assert!(report.visited_urls.contains(&"https://docs.example.com/rust".to_string()));
    assert_eq!(report.references.len(), 1);
    assert_eq!(report.references[0].url, "https://docs.example.com/rust");
    assert!(report.all_urls.contains(&"https://docs.example.com/rust".to_string()));
}

#[tokio::test]
async fn test_conversation_must_end_with_user_message() {
    let llm = Arc::new(ScriptedLlm::new());
    let session = make_session(
        llm,
        Arc::new(StubSearch::default()),
        Arc::new(StubReader::default()),
        100_000,
        HostPolicy::default(),
    );
    let result = research_loop(&session, &[Message::assistant("hello")]).await;
    assert!(result.is_err());
}

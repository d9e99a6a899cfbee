//! 研究主循环
//!
//! 预算内迭代：选问题 → 播种评估准则 → 排序候选 URL → 组 prompt 让 LLM
//! 在允许动作中选一步 → 派发 {search, visit, reflect, answer, coding} →
//! 写日记、发事件、复位允许集。回答被评估器接受或预算耗尽后进入强制收尾，
//! 保证任何请求都以一个回答结束。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, TokenTracker};
use crate::knowledge::{KnowledgeItem, KnowledgeKind, Reference};
use crate::llm::{generate_object, schema_of, LlmClient, Message, Role};
use crate::research::actions::{
    action_schema, ActionKind, AllowedActions, AnswerDraft, StepAction, MAX_QUERIES_PER_STEP,
    MAX_REFLECT_PER_STEP, MAX_URLS_PER_STEP,
};
use crate::research::evaluator::{Criterion, CriterionKind, Evaluator};
use crate::research::events::{ActionTracker, FinalReport};
use crate::research::prompt;
use crate::research::state::ResearchState;
use crate::tools::{SearchQuery, ToolSet};
use crate::urls::{
    diversity_cap, normalize_url, rank_candidates, BoostedUrl, HostPolicy,
    HARD_MAX_RETURNED_URLS, TOP_URLS_IN_PROMPT,
};

/// 排序候选超过该数时暂停 search，先消化已有 URL
const MAX_RANKED_BEFORE_SEARCH_OFF: usize = 200;
/// visit 目标与排序榜首的并集宽度
const TOP_RANKED_UNION: usize = 2;
/// coding 上下文里附带的知识与 URL 条数
const CODING_CONTEXT_URLS: usize = 20;

/// 单请求的循环参数
#[derive(Clone, Debug)]
pub struct ResearchOptions {
    /// 每条评估准则允许的否决次数
    pub max_bad_attempts: u32,
    /// 为真时禁止第一步免引用直答
    pub no_direct_answer: bool,
    /// 响应体返回的 URL 数上限
    pub max_returned_urls: usize,
    pub host_policy: HostPolicy,
    /// 相邻两步之间的退避毫秒数
    pub step_sleep_ms: u64,
    /// 设置后每步写调试快照到该目录
    pub debug_dir: Option<PathBuf>,
}

impl Default for ResearchOptions {
    fn default() -> Self {
        Self {
            max_bad_attempts: 1,
            no_direct_answer: false,
            max_returned_urls: crate::urls::DEFAULT_MAX_RETURNED_URLS,
            host_policy: HostPolicy::default(),
            step_sleep_ms: 0,
            debug_dir: None,
        }
    }
}

/// 单请求会话：LLM、协作方、预算追踪、事件出口与取消令牌
pub struct ResearchSession {
    pub llm: Arc<dyn LlmClient>,
    pub tools: ToolSet,
    pub tracker: Arc<TokenTracker>,
    pub actions: ActionTracker,
    pub cancel: CancellationToken,
    pub options: ResearchOptions,
}

enum AnswerOutcome {
    Final(FinalReport),
    /// 原始问题的准则集耗尽，直接转强制收尾
    Exhausted,
    Rejected,
    SubAccepted,
}

/// 执行研究循环直至产出终局回答
pub async fn research_loop(
    session: &ResearchSession,
    conversation: &[Message],
) -> Result<FinalReport, AgentError> {
    let question = extract_question(conversation)?;
    tracing::info!(question = %question, budget = session.tracker.budget(), "research started");

    let mut state = ResearchState::new(question.clone());
    preload_conversation_urls(&mut state, conversation);
    if conversation.len() > 1 {
        let history = conversation
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                format!("{role}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n");
        state.knowledge.push(KnowledgeItem::new(
            "What was discussed earlier in this conversation?",
            history,
            KnowledgeKind::ChatHistory,
        ));
    }

    let evaluator = Evaluator::new(session.llm.clone(), session.tracker.clone());
    let mut decision_failures = 0u32;

    while !session.tracker.over_soft_limit() {
        if session.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        state.total_step += 1;
        state.step += 1;
        let current_question = state.current_gap();
        tracing::info!(
            total_step = state.total_step,
            gaps = state.gaps.len(),
            question = %current_question,
            "step"
        );

        // 准则播种：原始问题首次出现时做一次选择调用，子问题准则集为空
        if !state.criteria.contains_key(&current_question) {
            let criteria = if state.is_original(&current_question) {
                match evaluator
                    .select_criteria(&current_question, session.options.max_bad_attempts)
                    .await
                {
                    Ok(criteria) => criteria,
                    Err(e) => {
                        tracing::warn!(error = %e, "criteria selection failed, falling back to strict only");
                        vec![Criterion {
                            kind: CriterionKind::Strict,
                            remaining_attempts: session.options.max_bad_attempts,
                        }]
                    }
                }
            } else {
                Vec::new()
            };
            state.criteria.insert(current_question.clone(), criteria);
        }

        // freshness 首步封锁：必须先搜索，不得直答或发散
        if state.total_step == 1
            && state.is_original(&current_question)
            && state
                .criteria
                .get(&current_question)
                .map(|c| c.iter().any(|x| x.kind == CriterionKind::Freshness))
                .unwrap_or(false)
        {
            state.allow.answer = false;
            state.allow.reflect = false;
        }

        // 排序候选 URL，并据此调节允许集
        let ranked = rank_urls(session, &state, &current_question).await;
        if ranked.is_empty() {
            state.allow.visit = false;
        }
        if ranked.len() > MAX_RANKED_BEFORE_SEARCH_OFF {
            state.allow.search = false;
        }
        let shown: Vec<BoostedUrl> = ranked.iter().take(TOP_URLS_IN_PROMPT).cloned().collect();

        let allowed = state.allow;
        let system = prompt::build_system_prompt(&state, &allowed, &shown);
        let messages = prompt::build_user_messages(&state, conversation, &current_question);
        let schema = action_schema(&allowed);
        write_debug_snapshot(
            session.options.debug_dir.as_deref(),
            state.total_step,
            &system,
            &schema,
            &messages,
        );

        let action: StepAction = match generate_object(
            session.llm.as_ref(),
            &session.tracker,
            "agent",
            &system,
            &messages,
            &schema,
        )
        .await
        {
            Ok(action) => {
                decision_failures = 0;
                action
            }
            Err(e) => {
                tracing::warn!(error = %e, "step decision failed");
                decision_failures += 1;
                if decision_failures >= 3 {
                    // LLM 持续不可用时不再空转，直接转强制收尾
                    break;
                }
                state.note(format!(
                    "At step {}, the step decision did not produce a usable action; choose \
                     again more carefully.",
                    state.total_step
                ));
                step_sleep(session).await;
                continue;
            }
        };

        // LLM 偶尔无视收窄后的 Schema；拦下并在下一步继续关闭该动作
        if !allowed.allows(action.kind()) {
            state.note(format!(
                "At step {}, you chose the currently disabled action \"{}\"; pick among the \
                 allowed actions instead.",
                state.total_step,
                action.kind().as_str()
            ));
            state.allow = AllowedActions::default();
            state.allow.disable(action.kind());
            step_sleep(session).await;
            continue;
        }

        // visit 目标提前翻译，让 step 事件带上 URL
        let visit_targets = match &action {
            StepAction::Visit { url_indices, .. } => {
                translate_visit_targets(&state, &shown, &ranked, url_indices)
            }
            _ => Vec::new(),
        };
        session
            .actions
            .publish_step(state.total_step, action.think(), visit_targets.clone());

        let dispatched = action.kind();
        let mut answer_rejected = false;
        match action {
            StepAction::Answer {
                answer,
                references,
                md_answer,
                ..
            } => {
                let outcome = dispatch_answer(
                    session,
                    &mut state,
                    &evaluator,
                    &current_question,
                    answer,
                    references,
                    md_answer,
                )
                .await?;
                match outcome {
                    AnswerOutcome::Final(report) => return Ok(report),
                    AnswerOutcome::Exhausted => break,
                    AnswerOutcome::Rejected => answer_rejected = true,
                    AnswerOutcome::SubAccepted => {}
                }
            }
            StepAction::Search { queries, .. } => {
                dispatch_search(session, &mut state, &current_question, queries).await;
            }
            StepAction::Visit { .. } => {
                dispatch_visit(session, &mut state, visit_targets).await;
            }
            StepAction::Reflect { sub_questions, .. } => {
                dispatch_reflect(&mut state, sub_questions);
            }
            StepAction::Coding { issue, .. } => {
                dispatch_coding(session, &mut state, &issue).await;
            }
        }

        // 派发后整体复位，再按动作关闭自己到下一步
        state.allow = AllowedActions::default();
        match dispatched {
            ActionKind::Answer => {
                if answer_rejected {
                    state.allow.answer = false;
                }
            }
            other => state.allow.disable(other),
        }
        step_sleep(session).await;
    }

    beast_mode(session, &mut state, conversation, &question).await
}

/// 对话末条 user 消息即当前问题
fn extract_question(conversation: &[Message]) -> Result<String, AgentError> {
    let last = conversation
        .last()
        .ok_or_else(|| AgentError::InvalidRequest("empty conversation".to_string()))?;
    if last.role != Role::User {
        return Err(AgentError::InvalidRequest(
            "conversation must end with a user message".to_string(),
        ));
    }
    let question = last.content.trim().to_string();
    if question.is_empty() {
        return Err(AgentError::InvalidRequest("empty question".to_string()));
    }
    Ok(question)
}

/// 对话里出现过的 URL 预载进仓库（权重 1）
fn preload_conversation_urls(state: &mut ResearchState, conversation: &[Message]) {
    let re = regex::Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("static regex parses");
    for message in conversation {
        for m in re.find_iter(&message.content) {
            state.urls.add(m.as_str(), "", "", None, 1.0);
        }
    }
}

/// 过滤 + 可选重排 + 打分 + 多样性截断
async fn rank_urls(
    session: &ResearchSession,
    state: &ResearchState,
    question: &str,
) -> Vec<BoostedUrl> {
    let policy = &session.options.host_policy;
    let candidates = state.urls.candidates(&state.visited, policy);
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut scores: HashMap<String, f32> = HashMap::new();
    if let Some(reranker) = &session.tools.reranker {
        let texts: Vec<String> = candidates
            .iter()
            .map(|r| format!("{} {} {}", r.url, r.title, r.description))
            .collect();
        match reranker.rerank(question, &texts).await {
            Ok(values) => {
                for (record, score) in candidates.iter().zip(values) {
                    scores.insert(record.url.clone(), score);
                }
            }
            Err(e) => tracing::warn!(error = %e, "rerank unavailable, scoring without it"),
        }
    }

    diversity_cap(rank_candidates(candidates, policy, &scores))
}

/// visit 下标翻译：1 起始下标 → URL，并入排序榜首，去已访问，截断到单步上限
fn translate_visit_targets(
    state: &ResearchState,
    shown: &[BoostedUrl],
    ranked: &[BoostedUrl],
    indices: &[usize],
) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for &i in indices {
        if i >= 1 {
            if let Some(b) = shown.get(i - 1) {
                if !targets.contains(&b.record.url) {
                    targets.push(b.record.url.clone());
                }
            }
        }
    }
    for b in ranked.iter().take(TOP_RANKED_UNION) {
        if !targets.contains(&b.record.url) {
            targets.push(b.record.url.clone());
        }
    }
    targets
        .into_iter()
        .filter(|u| !state.visited.contains(u) && !state.bad_urls.contains(u))
        .take(MAX_URLS_PER_STEP)
        .collect()
}

/// 并发抓取一组 URL；成功写知识库与 visited，失败进 bad_urls。返回 (成功数, 失败数)
async fn read_pages(
    session: &ResearchSession,
    state: &mut ResearchState,
    urls: &[String],
) -> (usize, usize) {
    let futures: Vec<_> = urls
        .iter()
        .map(|url| {
            let reader = session.tools.reader.clone();
            let url = url.clone();
            async move {
                let result = reader.read(&url).await;
                (url, result)
            }
        })
        .collect();

    let mut ok = 0;
    let mut failed = 0;
    for (url, result) in join_all(futures).await {
        match result {
            Ok(page) => {
                ok += 1;
                state.urls.add(&url, &page.title, &page.description, page.date.clone(), 1.0);
                for (text, link) in page.links.iter().take(20) {
                    state.urls.add(link, text, "", None, 1.0);
                }
                state.knowledge.push(
                    KnowledgeItem::new(
                        format!("What is in {url}?"),
                        page.content,
                        KnowledgeKind::Url,
                    )
                    .with_references(vec![Reference {
                        url: url.clone(),
                        title: page.title,
                        exact_quote: String::new(),
                        date_time: page.date,
                    }]),
                );
                state.visited.insert(url);
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(url = %url, error = %e, "page read failed");
                state.bad_urls.insert(url);
            }
        }
    }
    (ok, failed)
}

/// 引用整备：丢空 URL、清洗引文、并入仓库元数据、并发探测最后修改时间
async fn enrich_references(
    session: &ResearchSession,
    state: &ResearchState,
    references: Vec<Reference>,
) -> Vec<Reference> {
    let mut out: Vec<Reference> = Vec::new();
    for r in references {
        let Some(url) = normalize_url(&r.url) else {
            continue;
        };
        let mut reference = Reference {
            exact_quote: clean_quote(&r.exact_quote),
            url: url.clone(),
            title: r.title,
            date_time: r.date_time,
        };
        if let Some(record) = state.urls.get(&url) {
            if reference.title.is_empty() {
                reference.title = record.title.clone();
            }
            if reference.date_time.is_none() {
                reference.date_time = record.date.clone();
            }
        }
        out.push(reference);
    }

    let probes: Vec<_> = out
        .iter()
        .map(|r| {
            let reader = session.tools.reader.clone();
            let url = r.url.clone();
            let existing = r.date_time.clone();
            async move {
                if existing.is_some() {
                    existing
                } else {
                    reader.last_modified(&url).await
                }
            }
        })
        .collect();
    for (reference, date) in out.iter_mut().zip(join_all(probes).await) {
        reference.date_time = date;
    }
    out
}

/// 引文清洗：去掉非常规字符噪声并折叠空白
fn clean_quote(quote: &str) -> String {
    quote
        .chars()
        .filter(|c| {
            c.is_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '.' | ',' | '\'' | '-' | ':' | ';' | '%' | '$' | '(' | ')')
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

async fn dispatch_answer(
    session: &ResearchSession,
    state: &mut ResearchState,
    evaluator: &Evaluator,
    current_question: &str,
    text: String,
    references: Vec<Reference>,
    md_answer: Option<String>,
) -> Result<AnswerOutcome, AgentError> {
    let references = enrich_references(session, state, references).await;
    let mut draft = AnswerDraft {
        text,
        references,
        md_answer,
        is_final: false,
    };

    // 第一步、无引用、允许直答：按寒暄式提问直接收尾
    if state.total_step == 1 && draft.references.is_empty() && !session.options.no_direct_answer {
        draft.is_final = true;
        tracing::info!("trivial answer accepted at step 1");
        let report = build_report(session, state, &draft);
        session.actions.publish_final(report.clone());
        return Ok(AnswerOutcome::Final(report));
    }

    // 引用的页面要真的读过：未见过的先抓取入知识库，再进评估
    let unseen: Vec<String> = draft
        .references
        .iter()
        .map(|r| r.url.clone())
        .filter(|u| !state.visited.contains(u) && !state.bad_urls.contains(u))
        .collect();
    if !unseen.is_empty() {
        read_pages(session, state, &unseen).await;
    }

    let criteria = state
        .criteria
        .get(current_question)
        .cloned()
        .unwrap_or_default();
    let evaluation = evaluator
        .evaluate(current_question, &draft, &criteria, &state.knowledge)
        .await?;

    if evaluation.pass {
        if state.is_original(current_question) {
            draft.is_final = true;
            state.note(format!(
                "At step {}, you answered the question \"{current_question}\" and the answer \
                 passed every evaluation.",
                state.total_step
            ));
            let report = build_report(session, state, &draft);
            session.actions.publish_final(report.clone());
            return Ok(AnswerOutcome::Final(report));
        }
        // 子问题：答案入知识库，gap 出队
        state.knowledge.push(
            KnowledgeItem::new(current_question, draft.text.clone(), KnowledgeKind::Qa)
                .with_references(draft.references.clone()),
        );
        state.gaps.retain(|g| g != current_question);
        state.note(format!(
            "At step {}, you answered the sub-question \"{current_question}\"; it is no \
             longer an open gap.",
            state.total_step
        ));
        return Ok(AnswerOutcome::SubAccepted);
    }

    // 否决路径
    let kind = evaluation.kind.unwrap_or(CriterionKind::Strict);
    if !state.is_original(current_question) {
        state.note(format!(
            "At step {}, the answer to sub-question \"{current_question}\" was rejected \
             ({}): {}",
            state.total_step,
            kind.as_str(),
            evaluation.think
        ));
        return Ok(AnswerOutcome::Rejected);
    }

    let remaining = {
        let list = state
            .criteria
            .entry(current_question.to_string())
            .or_default();
        if let Some(criterion) = list.iter_mut().find(|c| c.kind == kind) {
            criterion.remaining_attempts = criterion.remaining_attempts.saturating_sub(1);
        }
        list.retain(|c| c.remaining_attempts > 0);
        list.len()
    };
    if kind == CriterionKind::Strict {
        if let Some(plan) = &evaluation.improvement_plan {
            state.improvements.push(plan.clone());
        }
    }
    if remaining == 0 {
        tracing::warn!("all evaluation criteria exhausted, forcing final answer");
        return Ok(AnswerOutcome::Exhausted);
    }

    state.note(format!(
        "At step {}, you answered \"{current_question}\" but the {} check rejected it: {}",
        state.total_step,
        kind.as_str(),
        evaluation.think
    ));
    match evaluator
        .analyze_failure(current_question, &state.diary, &evaluation.think)
        .await
    {
        Ok(analysis) => {
            state.knowledge.push(KnowledgeItem::new(
                format!("Why is the attempted answer to \"{current_question}\" not good enough?"),
                format!(
                    "Recap: {}\nBlame: {}\nImprovement: {}",
                    analysis.recap, analysis.blame, analysis.improvement
                ),
                KnowledgeKind::Qa,
            ));
        }
        Err(e) => tracing::warn!(error = %e, "failure analysis unavailable"),
    }
    state.reset_attempt();
    Ok(AnswerOutcome::Rejected)
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct QueryRewrite {
    think: String,
    /// 精炼后的查询，可带语言 / 地域 / 时间过滤
    queries: Vec<RewrittenQuery>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct RewrittenQuery {
    q: String,
    /// 语言码（如 en、zh）
    hl: Option<String>,
    /// 国家码（如 us、cn）
    gl: Option<String>,
    /// 时间过滤（如 qdr:d、qdr:w、qdr:m）
    tbs: Option<String>,
}

async fn dispatch_search(
    session: &ResearchSession,
    state: &mut ResearchState,
    current_question: &str,
    queries: Vec<String>,
) {
    let queries: Vec<String> = queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && !state.has_keyword(q))
        .take(MAX_QUERIES_PER_STEP)
        .collect();
    if queries.is_empty() {
        state.note(format!(
            "At step {}, every proposed query was already tried; think of genuinely new \
             keywords.",
            state.total_step
        ));
        return;
    }

    let site = session
        .options
        .host_policy
        .only_hostnames
        .first()
        .cloned();

    // 第一遍：原样执行，结果入仓库并合成 side-info 知识
    let mut total_hits = 0usize;
    let mut snippets: Vec<String> = Vec::new();
    for query in &queries {
        state.all_keywords.push(query.clone());
        match session.tools.search.search(&SearchQuery::plain(query.as_str())).await {
            Ok(hits) => {
                total_hits += hits.len();
                let digest = ingest_hits(state, query, &hits);
                if let Some(d) = digest {
                    snippets.push(d);
                }
            }
            Err(e) => {
                tracing::warn!(query = %query, error = %e, "search failed");
                state.note(format!(
                    "At step {}, the search for \"{query}\" failed: {e}.",
                    state.total_step
                ));
            }
        }
    }

    // 查询重写：基于第一遍摘要精炼，第二遍并发执行
    let rewritten = rewrite_queries(session, state, current_question, &snippets).await;
    let second_pass: Vec<SearchQuery> = rewritten
        .into_iter()
        .filter(|q| !state.has_keyword(&q.query))
        .take(MAX_QUERIES_PER_STEP)
        .map(|mut q| {
            if let Some(host) = &site {
                q.query = format!("{} site:{host}", q.query);
            }
            q
        })
        .collect();
    for q in &second_pass {
        state.all_keywords.push(q.query.clone());
    }
    let futures: Vec<_> = second_pass
        .iter()
        .map(|q| {
            let search = session.tools.search.clone();
            let q = q.clone();
            async move {
                let result = search.search(&q).await;
                (q.query, result)
            }
        })
        .collect();
    for (query, result) in join_all(futures).await {
        match result {
            Ok(hits) => {
                total_hits += hits.len();
                ingest_hits(state, &query, &hits);
            }
            Err(e) => tracing::warn!(query = %query, error = %e, "second-pass search failed"),
        }
    }

    if total_hits == 0 {
        state.note(format!(
            "At step {}, no search pass returned results; think differently and attack the \
             question from another angle.",
            state.total_step
        ));
    } else {
        state.note(format!(
            "At step {}, you searched for [{}] and discovered {total_hits} results.",
            state.total_step,
            queries.join("; ")
        ));
    }
}

/// 结果入仓库并合成一条 side-info 知识；返回摘要文本供查询重写
fn ingest_hits(
    state: &mut ResearchState,
    query: &str,
    hits: &[crate::tools::SearchHit],
) -> Option<String> {
    if hits.is_empty() {
        return None;
    }
    let mut lines: Vec<String> = Vec::new();
    for hit in hits {
        if let Some(url) = state
            .urls
            .add(&hit.url, &hit.title, &hit.description, hit.date.clone(), 1.0)
        {
            lines.push(format!("{} — {} ({url})", hit.title, hit.description));
        }
    }
    if lines.is_empty() {
        return None;
    }
    let digest = lines.join("\n");
    state.knowledge.push(KnowledgeItem::new(
        format!("What do sources say about \"{query}\"?"),
        digest.clone(),
        KnowledgeKind::SideInfo,
    ));
    Some(digest)
}

async fn rewrite_queries(
    session: &ResearchSession,
    state: &ResearchState,
    current_question: &str,
    snippets: &[String],
) -> Vec<SearchQuery> {
    if snippets.is_empty() {
        return Vec::new();
    }
    let system = format!(
        "You are a search query refinement specialist. Given first-pass search digests, \
         propose sharper follow-up queries that close the remaining gaps. Use hl/gl/tbs \
         filters when language, region or recency matters. Never repeat keywords that were \
         already searched.\nCurrent date: {}",
        chrono::Utc::now().format("%Y-%m-%d")
    );
    let context = format!(
        "Question: {current_question}\n\nAlready searched: {}\n\nFirst-pass digests:\n{}",
        state.all_keywords.join("; "),
        snippets.join("\n\n")
    );
    let schema = schema_of::<QueryRewrite>();
    let rewrite: Result<QueryRewrite, _> = generate_object(
        session.llm.as_ref(),
        &session.tracker,
        "agent",
        &system,
        &[Message::user(context)],
        &schema,
    )
    .await;
    match rewrite {
        Ok(r) => {
            tracing::debug!(think = %r.think, "queries rewritten");
            r.queries
                .into_iter()
                .map(|q| SearchQuery {
                    query: q.q,
                    language: q.hl,
                    country: q.gl,
                    time_filter: q.tbs,
                })
                .collect()
        }
        Err(e) => {
            tracing::warn!(error = %e, "query rewrite failed");
            Vec::new()
        }
    }
}

async fn dispatch_visit(
    session: &ResearchSession,
    state: &mut ResearchState,
    targets: Vec<String>,
) {
    if targets.is_empty() {
        state.note(format!(
            "At step {}, there was no unvisited URL worth reading; gather more candidates \
             first.",
            state.total_step
        ));
        return;
    }
    let (ok, failed) = read_pages(session, state, &targets).await;
    state.note(format!(
        "At step {}, you read {ok} page(s) [{}]{}.",
        state.total_step,
        targets.join("; "),
        if failed > 0 {
            format!(" ({failed} failed to load)")
        } else {
            String::new()
        }
    ));
}

fn dispatch_reflect(state: &mut ResearchState, sub_questions: Vec<String>) {
    let fresh: Vec<String> = sub_questions
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && !state.has_question(q))
        .take(MAX_REFLECT_PER_STEP)
        .collect();
    if fresh.is_empty() {
        state.note(format!(
            "At step {}, every proposed sub-question was already in play; think differently \
             about what is missing.",
            state.total_step
        ));
        return;
    }
    state.note(format!(
        "At step {}, you identified new knowledge gaps: [{}].",
        state.total_step,
        fresh.join("; ")
    ));
    for q in fresh {
        state.gaps.push(q.clone());
        state.all_questions.push(q);
    }
}

async fn dispatch_coding(session: &ResearchSession, state: &mut ResearchState, issue: &str) {
    let knowledge_context = state
        .knowledge
        .qa_pairs()
        .map(|(q, a)| format!("Q: {q}\nA: {}", a.chars().take(400).collect::<String>()))
        .collect::<Vec<_>>()
        .join("\n\n");
    let url_context = state
        .urls
        .all_urls()
        .into_iter()
        .take(CODING_CONTEXT_URLS)
        .collect::<Vec<_>>()
        .join("\n");
    let context = format!("{knowledge_context}\n\nKnown URLs:\n{url_context}");

    match session.tools.sandbox.solve(issue, &context).await {
        Ok(solution) => {
            state.knowledge.push(
                KnowledgeItem::new(
                    format!("What is the solution to: {issue}?"),
                    solution.output,
                    KnowledgeKind::Coding,
                )
                .with_source_code(solution.code),
            );
            state.note(format!(
                "At step {}, the code sandbox solved \"{issue}\".",
                state.total_step
            ));
        }
        Err(e) => {
            tracing::warn!(error = %e, "sandbox failed");
            state.note(format!(
                "At step {}, the code sandbox failed on \"{issue}\": {e}.",
                state.total_step
            ));
        }
    }
}

/// 强制收尾：仅允许 answer 的单次 LLM 调用，输出不再过评估
async fn beast_mode(
    session: &ResearchSession,
    state: &mut ResearchState,
    conversation: &[Message],
    question: &str,
) -> Result<FinalReport, AgentError> {
    tracing::warn!(
        total_tokens = session.tracker.total(),
        "entering forced answer mode"
    );
    state.total_step += 1;

    let system = prompt::build_beast_prompt(state);
    let messages = prompt::build_user_messages(state, conversation, question);
    let schema = action_schema(&AllowedActions::answer_only());
    let action: StepAction = generate_object(
        session.llm.as_ref(),
        &session.tracker,
        "agent",
        &system,
        &messages,
        &schema,
    )
    .await?;

    let StepAction::Answer {
        think,
        answer,
        references,
        md_answer,
    } = action
    else {
        return Err(AgentError::SchemaViolation(
            "forced answer call produced a non-answer action".to_string(),
        ));
    };

    session.actions.publish_step(state.total_step, think, Vec::new());
    let references = enrich_references(session, state, references).await;
    let draft = AnswerDraft {
        text: answer,
        references,
        md_answer,
        is_final: true,
    };
    let report = build_report(session, state, &draft);
    session.actions.publish_final(report.clone());
    Ok(report)
}

/// 终局报告：回答、引用与三份 URL 清单
fn build_report(
    session: &ResearchSession,
    state: &ResearchState,
    draft: &AnswerDraft,
) -> FinalReport {
    // 响应体的 all_urls 不排除已访问，统一打分后截断
    let empty_visited = std::collections::HashSet::new();
    let candidates = state
        .urls
        .candidates(&empty_visited, &session.options.host_policy);
    let ranked = diversity_cap(rank_candidates(
        candidates,
        &session.options.host_policy,
        &HashMap::new(),
    ));
    let cap = session
        .options
        .max_returned_urls
        .min(HARD_MAX_RETURNED_URLS);
    let all_urls: Vec<String> = ranked
        .into_iter()
        .take(cap)
        .map(|b| b.record.url)
        .collect();

    let mut visited_urls: Vec<String> = state
        .visited
        .union(&state.bad_urls)
        .cloned()
        .collect();
    visited_urls.sort();

    FinalReport {
        answer: draft.text.clone(),
        md_answer: draft.md_answer.clone(),
        references: draft.references.clone(),
        visited_urls,
        read_urls: state.knowledge.read_urls(),
        all_urls,
        total_tokens: session.tracker.total(),
        token_budget: session.tracker.budget(),
    }
}

async fn step_sleep(session: &ResearchSession) {
    if session.options.step_sleep_ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(session.options.step_sleep_ms)).await;
    }
}

/// 每步的调试快照（设置 debug_dir 时），仅供排查，不参与正确性
fn write_debug_snapshot(
    dir: Option<&Path>,
    total_step: usize,
    system: &str,
    schema: &serde_json::Value,
    messages: &[Message],
) {
    let Some(dir) = dir else {
        return;
    };
    let snapshot = serde_json::json!({
        "step": total_step,
        "system": system,
        "schema": schema,
        "messages": messages,
    });
    let path = dir.join(format!("step-{total_step}.json"));
    if let Err(e) = std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::write(&path, serde_json::to_vec_pretty(&snapshot).unwrap_or_default()))
    {
        tracing::debug!(error = %e, "debug snapshot write failed");
    }
}

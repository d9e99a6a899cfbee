//! Prompt 组装
//!
//! system 侧：身份与当前日期、仅列当前允许的动作段落、排序后的候选 URL
//! （1 起始下标）、日记、历史问题与已失败关键词。user 侧：知识库铺成的
//! Q/A 对 + 原始对话 + 当前问题。

use crate::llm::{Message, Role};
use crate::research::actions::{
    AllowedActions, MAX_QUERIES_PER_STEP, MAX_REFLECT_PER_STEP, MAX_URLS_PER_STEP,
};
use crate::research::state::ResearchState;
use crate::urls::BoostedUrl;

/// 步骤决策的 system prompt
pub fn build_system_prompt(
    state: &ResearchState,
    allowed: &AllowedActions,
    ranked: &[BoostedUrl],
) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!(
        "You are an advanced research agent. You answer questions by iteratively searching \
         the web, reading pages, reflecting on what is still unknown, running code when \
         computation is needed, and finally answering with citations. Pick exactly ONE action \
         for the current step.\nCurrent date: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));

    let mut actions: Vec<String> = Vec::new();
    if allowed.search {
        actions.push(format!(
            "<action-search>\nRun keyword queries against a web search engine. Provide up to \
             {MAX_QUERIES_PER_STEP} distinct queries, each covering a different angle. Avoid \
             keywords that already failed.\n</action-search>"
        ));
    }
    if allowed.visit {
        actions.push(format!(
            "<action-visit>\nRead the full content of promising URLs from the list below. \
             Provide up to {MAX_URLS_PER_STEP} 1-based indices.\n</action-visit>"
        ));
    }
    if allowed.reflect {
        actions.push(format!(
            "<action-reflect>\nIdentify knowledge gaps and propose up to {MAX_REFLECT_PER_STEP} \
             self-contained sub-questions whose answers would close them.\n</action-reflect>"
        ));
    }
    if allowed.coding {
        actions.push(
            "<action-coding>\nDelegate a computation, data transformation or calculation to a \
             code sandbox. Describe the issue precisely.\n</action-coding>"
                .to_string(),
        );
    }
    if allowed.answer {
        actions.push(
            "<action-answer>\nAnswer the current question definitively, citing references with \
             verbatim quotes from pages you have read. Only answer when the gathered knowledge \
             is sufficient.\n</action-answer>"
                .to_string(),
        );
    }
    sections.push(format!("## Available actions\n{}", actions.join("\n\n")));

    if !ranked.is_empty() && allowed.visit {
        let list = ranked
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let title = if b.record.title.is_empty() {
                    "(untitled)"
                } else {
                    b.record.title.as_str()
                };
                format!(
                    "{}. {} — {}\n   {}",
                    i + 1,
                    b.record.url,
                    title,
                    b.record.description.chars().take(160).collect::<String>()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Discovered URLs (ordered by relevance)\n{list}"));
    }

    if !state.diary.is_empty() {
        sections.push(format!(
            "## Steps taken so far\n{}",
            state.diary.join("\n")
        ));
    }

    if state.all_questions.len() > 1 {
        sections.push(format!(
            "## Questions in play\n{}",
            state
                .all_questions
                .iter()
                .map(|q| format!("- {q}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if !state.all_keywords.is_empty() {
        sections.push(format!(
            "## Keywords already searched (do not repeat)\n{}",
            state.all_keywords.join("; ")
        ));
    }

    sections.join("\n\n")
}

/// user 消息序列：知识 Q/A 对 + 原始对话 + 当前问题
pub fn build_user_messages(
    state: &ResearchState,
    conversation: &[Message],
    current_question: &str,
) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();

    for (question, answer) in state.knowledge.qa_pairs() {
        messages.push(Message::user(question));
        messages.push(Message::assistant(answer));
    }

    messages.extend(conversation.iter().cloned().filter(|m| m.role != Role::System));

    // 当前问题若与对话末条一致则不再重复
    let duplicated = messages
        .last()
        .map(|m| m.role == Role::User && m.content.trim() == current_question.trim())
        .unwrap_or(false);
    if !duplicated {
        messages.push(Message::user(current_question));
    }
    messages
}

/// 收尾模式的 system prompt：累计的改进计划作为约束性评审意见
pub fn build_beast_prompt(state: &ResearchState) -> String {
    let mut sections = vec![format!(
        "**Deadline reached. You MUST answer the question now with everything gathered so \
         far.** An educated, committed guess backed by the strongest available evidence beats \
         no answer. Cite references for every claim you can.\nCurrent date: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")
    )];

    if !state.improvements.is_empty() {
        sections.push(format!(
            "## Reviewer feedback (binding — your answer must address every point)\n{}",
            state
                .improvements
                .iter()
                .map(|p| format!("- {p}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if !state.diary.is_empty() {
        sections.push(format!("## Steps taken so far\n{}", state.diary.join("\n")));
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_lists_only_allowed_actions() {
        let state = ResearchState::new("q");
        let mut allowed = AllowedActions::default();
        allowed.answer = false;
        allowed.reflect = false;

        let prompt = build_system_prompt(&state, &allowed, &[]);
        assert!(prompt.contains("<action-search>"));
        assert!(!prompt.contains("<action-answer>"));
        assert!(!prompt.contains("<action-reflect>"));
    }

    #[test]
    fn test_user_messages_compose_knowledge_then_conversation() {
        let mut state = ResearchState::new("main question");
        state.knowledge.push(crate::knowledge::KnowledgeItem::new(
            "k-question",
            "k-answer",
            crate::knowledge::KnowledgeKind::SideInfo,
        ));
        let conversation = vec![Message::user("main question")];

        let messages = build_user_messages(&state, &conversation, "main question");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "k-question");
        assert_eq!(messages[1].content, "k-answer");
        assert_eq!(messages[2].content, "main question");
    }

    #[test]
    fn test_current_question_appended_when_it_differs() {
        let state = ResearchState::new("main question");
        let conversation = vec![Message::user("main question")];
        let messages = build_user_messages(&state, &conversation, "a sub question");
        assert_eq!(messages.last().unwrap().content, "a sub question");
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_beast_prompt_carries_improvements() {
        let mut state = ResearchState::new("q");
        state.improvements.push("add primary sources".to_string());
        let prompt = build_beast_prompt(&state);
        assert!(prompt.contains("binding"));
        assert!(prompt.contains("add primary sources"));
    }
}

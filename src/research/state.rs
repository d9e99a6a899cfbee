//! 单请求调度状态
//!
//! 所有状态随请求创建、随响应写完销毁；请求内由调度循环独占修改。
//! 日记归当前尝试所有：回答被否决重置时清空，total_step 不重置。

use std::collections::{HashMap, HashSet};

use crate::knowledge::KnowledgeBase;
use crate::research::actions::AllowedActions;
use crate::research::evaluator::Criterion;
use crate::urls::UrlStore;

/// 调度循环的全部可变状态
pub struct ResearchState {
    /// 原始问题（gaps[0] 恒为它）
    pub question: String,
    /// 未解决的问题队列：原始问题 + reflect 产生的子问题
    pub gaps: Vec<String>,
    /// 历史上出现过的所有问题（去重用）
    pub all_questions: Vec<String>,
    /// 已执行过的所有搜索关键词（去重用）
    pub all_keywords: Vec<String>,
    pub knowledge: KnowledgeBase,
    pub urls: UrlStore,
    /// 成功读取的 URL
    pub visited: HashSet<String>,
    /// 抓取失败的 URL
    pub bad_urls: HashSet<String>,
    /// 当前尝试的步骤叙事，喂入下一步 prompt
    pub diary: Vec<String>,
    /// 问题 → 评估准则集；条目存在即表示已做过准则选择
    pub criteria: HashMap<String, Vec<Criterion>>,
    /// strict 否决累积的改进计划，收尾时作为约束性评审意见
    pub improvements: Vec<String>,
    pub allow: AllowedActions,
    /// 当前尝试内的步数（否决重置时清零）
    pub step: usize,
    /// 全局步数，每次循环迭代严格 +1，从不回退
    pub total_step: usize,
}

impl ResearchState {
    pub fn new(question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            gaps: vec![question.clone()],
            all_questions: vec![question.clone()],
            question,
            all_keywords: Vec::new(),
            knowledge: KnowledgeBase::new(),
            urls: UrlStore::new(),
            visited: HashSet::new(),
            bad_urls: HashSet::new(),
            diary: Vec::new(),
            criteria: HashMap::new(),
            improvements: Vec::new(),
            allow: AllowedActions::default(),
            step: 0,
            total_step: 0,
        }
    }

    /// 轮转选择当前问题：gaps[total_step mod len]
    pub fn current_gap(&self) -> String {
        self.gaps[self.total_step % self.gaps.len()].clone()
    }

    pub fn is_original(&self, question: &str) -> bool {
        question == self.question
    }

    /// 大小写不敏感的问题查重
    pub fn has_question(&self, question: &str) -> bool {
        let q = question.trim().to_lowercase();
        self.all_questions.iter().any(|x| x.trim().to_lowercase() == q)
    }

    /// 大小写不敏感的关键词查重
    pub fn has_keyword(&self, keyword: &str) -> bool {
        let k = keyword.trim().to_lowercase();
        self.all_keywords.iter().any(|x| x.trim().to_lowercase() == k)
    }

    /// 追加一条日记叙事
    pub fn note(&mut self, entry: impl Into<String>) {
        self.diary.push(entry.into());
    }

    /// 回答被否决后的重置：清日记、清尝试内步数（total_step 保持递增）
    pub fn reset_attempt(&mut self) {
        self.diary.clear();
        self.step = 0;
    }
}

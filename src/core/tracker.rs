//! Token 预算追踪
//!
//! 按工具累计 token 消耗并回答「是否超出预算」。主循环在每次迭代前检查软上限
//! （预算的 85%），剩余部分留给强制收尾的最后一次 LLM 调用。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// 软上限比例：主循环在消耗达到预算的该比例时退出，余量留给收尾调用
pub const SOFT_BUDGET_RATIO: f64 = 0.85;

/// 按工具累计 token 使用；total 用原子计数供热路径读取
#[derive(Debug)]
pub struct TokenTracker {
    budget: u64,
    total: AtomicU64,
    per_tool: Mutex<HashMap<String, u64>>,
}

impl TokenTracker {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            total: AtomicU64::new(0),
            per_tool: Mutex::new(HashMap::new()),
        }
    }

    /// 记录一次调用的 token 消耗（prompt + completion）
    pub fn track(&self, tool: &str, tokens: u64) {
        self.total.fetch_add(tokens, Ordering::Relaxed);
        if let Ok(mut map) = self.per_tool.lock() {
            *map.entry(tool.to_string()).or_insert(0) += tokens;
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// 主循环的退出条件：消耗已达软上限
    pub fn over_soft_limit(&self) -> bool {
        self.total() as f64 >= self.budget as f64 * SOFT_BUDGET_RATIO
    }

    /// 按工具的消耗明细（排序后返回，便于日志与响应 usage 字段）
    pub fn breakdown(&self) -> Vec<(String, u64)> {
        let mut items: Vec<(String, u64)> = self
            .per_tool
            .lock()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        items.sort_by(|a, b| b.1.cmp(&a.1));
        items
    }
}

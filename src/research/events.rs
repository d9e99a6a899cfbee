//! 研究过程事件：单生产者（调度循环）→ 单消费者（流式通道）
//!
//! 每步动作发布一条 Step 事件；终局回答通过 finalize 信号 + Final 事件下发，
//! 流式通道据此执行「冲刷在途内容 → 清空队列 → 收尾」的抢占语义。

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::knowledge::Reference;

/// 终局结果：回答、引用与 URL 清单（响应体与 Final 事件共用）
#[derive(Clone, Debug, Default, Serialize)]
pub struct FinalReport {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md_answer: Option<String>,
    pub references: Vec<Reference>,
    /// 尝试访问过的 URL
    pub visited_urls: Vec<String>,
    /// 成功读取的 URL
    pub read_urls: Vec<String>,
    /// 排序后的全部候选 URL（截断到 max_returned_urls）
    pub all_urls: Vec<String>,
    pub total_tokens: u64,
    pub token_budget: u64,
}

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResearchEvent {
    /// 一步动作的思考文本；访问动作附带目标 URL 列表
    Step {
        step: usize,
        think: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        urls: Vec<String>,
    },
    /// 终局回答
    Final { report: FinalReport },
    /// 致命错误（流式模式下转为 error chunk）
    Error { text: String },
}

/// 事件订阅端：事件接收器 + finalize 信号
pub struct EventStream {
    pub events: mpsc::UnboundedReceiver<ResearchEvent>,
    pub finalize: watch::Receiver<bool>,
}

/// 动作追踪器：调度循环的事件出口
///
/// detached 模式（非流式请求）下丢弃所有事件，调用方只读返回值。
pub struct ActionTracker {
    tx: Option<mpsc::UnboundedSender<ResearchEvent>>,
    finalize: watch::Sender<bool>,
}

impl ActionTracker {
    /// 创建追踪器与其订阅端
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (fin_tx, fin_rx) = watch::channel(false);
        (
            Self {
                tx: Some(tx),
                finalize: fin_tx,
            },
            EventStream {
                events: rx,
                finalize: fin_rx,
            },
        )
    }

    /// 无订阅者的追踪器（非流式模式）
    pub fn detached() -> Self {
        let (fin_tx, _) = watch::channel(false);
        Self {
            tx: None,
            finalize: fin_tx,
        }
    }

    fn send(&self, ev: ResearchEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ev);
        }
    }

    pub fn publish_step(&self, step: usize, think: impl Into<String>, urls: Vec<String>) {
        self.send(ResearchEvent::Step {
            step,
            think: think.into(),
            urls,
        });
    }

    pub fn publish_error(&self, text: impl Into<String>) {
        self.send(ResearchEvent::Error { text: text.into() });
    }

    /// 发布终局：先置 finalize 信号（在途打字立即观察到并整体冲刷），再入队 Final
    pub fn publish_final(&self, report: FinalReport) {
        let _ = self.finalize.send(true);
        self.send(ResearchEvent::Final { report });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let (tracker, mut stream) = ActionTracker::new();
        tracker.publish_step(1, "first", vec![]);
        tracker.publish_step(2, "second", vec!["https://a.com/".to_string()]);

        match stream.events.recv().await.unwrap() {
            ResearchEvent::Step { step, think, .. } => {
                assert_eq!(step, 1);
                assert_eq!(think, "first");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.events.recv().await.unwrap() {
            ResearchEvent::Step { step, urls, .. } => {
                assert_eq!(step, 2);
                assert_eq!(urls.len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finalize_signal_precedes_final_event() {
        let (tracker, mut stream) = ActionTracker::new();
        assert!(!*stream.finalize.borrow());
        tracker.publish_final(FinalReport::default());
        assert!(*stream.finalize.borrow());
        assert!(matches!(
            stream.events.recv().await.unwrap(),
            ResearchEvent::Final { .. }
        ));
    }

    #[test]
    fn test_detached_tracker_drops_events() {
        let tracker = ActionTracker::detached();
        tracker.publish_step(1, "ignored", vec![]);
        tracker.publish_final(FinalReport::default());
    }
}

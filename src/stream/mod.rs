//! 流式进度通道
//!
//! 单消费者串行消化调度循环的事件队列：把每条思考文本切成类词片段，按字符类
//! （普通词、首字母大写、CJK、URL、标点停顿）配速吐出，连续三个短片段后进入
//! 加速档。visit 步骤先于思考文本逐条发 url chunk。收尾抢占：finalize 信号
//! 置位后在途片段一次性冲刷，队列里剩余思考直接丢弃，随后发 thinking-end
//! 标记与终局回答。客户端断连时停止配速，静默消化到 Final 为止。

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::research::{EventStream, FinalReport, ResearchEvent};

/// 送往响应层的 chunk
#[derive(Clone, Debug)]
pub enum StreamChunk {
    Think { text: String },
    Url { url: String },
    /// 思考结束标记（</think>）
    ThinkingEnd,
    Answer(Box<FinalReport>),
    Error { text: String },
}

/// 字符类，决定片段后的停顿
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharClass {
    Word,
    /// 首字母大写的词（句首、专名），停顿略长
    Capital,
    /// 以断句标点收尾的词
    Punct,
    Cjk,
    /// URL 整体一个片段，快速吐出
    Url,
}

/// 类词片段
#[derive(Clone, Debug)]
pub struct Fragment {
    pub text: String,
    pub class: CharClass,
}

/// 各字符类的停顿配置
#[derive(Clone, Copy, Debug)]
pub struct TypingPacing {
    pub word_delay: Duration,
    pub capital_delay: Duration,
    pub punct_delay: Duration,
    pub cjk_delay: Duration,
    pub url_delay: Duration,
}

impl TypingPacing {
    /// 自然手感的默认配速
    pub fn natural() -> Self {
        Self {
            word_delay: Duration::from_millis(45),
            capital_delay: Duration::from_millis(70),
            punct_delay: Duration::from_millis(140),
            cjk_delay: Duration::from_millis(25),
            url_delay: Duration::from_millis(10),
        }
    }

    /// 零停顿（测试与非交互场景）
    pub fn instant() -> Self {
        Self {
            word_delay: Duration::ZERO,
            capital_delay: Duration::ZERO,
            punct_delay: Duration::ZERO,
            cjk_delay: Duration::ZERO,
            url_delay: Duration::ZERO,
        }
    }

    fn base_delay(&self, class: CharClass) -> Duration {
        match class {
            CharClass::Word => self.word_delay,
            CharClass::Capital => self.capital_delay,
            CharClass::Punct => self.punct_delay,
            CharClass::Cjk => self.cjk_delay,
            CharClass::Url => self.url_delay,
        }
    }
}

/// 连续短片段计数；达到 3 后停顿缩到三分之一（加速档）
#[derive(Debug, Default)]
pub struct TypingState {
    consecutive_short: usize,
}

/// 短片段的字符数上限
const SHORT_FRAGMENT_CHARS: usize = 4;
/// 加速档的停顿除数
const BURST_DIVISOR: u32 = 3;

impl TypingState {
    pub fn next_delay(&mut self, fragment: &Fragment, pacing: &TypingPacing) -> Duration {
        if fragment.text.trim().chars().count() <= SHORT_FRAGMENT_CHARS {
            self.consecutive_short += 1;
        } else {
            self.consecutive_short = 0;
        }
        let base = pacing.base_delay(fragment.class);
        if self.consecutive_short >= 3 {
            base / BURST_DIVISOR
        } else {
            base
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // 日文假名
        | 0x3400..=0x4DBF    // CJK 扩展 A
        | 0x4E00..=0x9FFF    // CJK 统一表意
        | 0xAC00..=0xD7AF    // 谚文
    )
}

fn ends_with_break_punct(s: &str) -> bool {
    s.trim_end()
        .chars()
        .last()
        .map(|c| matches!(c, '.' | ',' | '!' | '?' | ';' | ':' | '。' | '，' | '！' | '？'))
        .unwrap_or(false)
}

/// 把文本切成带字符类的类词片段；每个片段带上它后面的空白
pub fn fragments(text: &str) -> Vec<Fragment> {
    let mut out: Vec<Fragment> = Vec::new();
    for token in text.split_inclusive(char::is_whitespace) {
        let word = token.trim_end();
        if word.is_empty() {
            // 连续空白归并进上一个片段
            if let Some(last) = out.last_mut() {
                last.text.push_str(token);
            }
            continue;
        }
        if word.starts_with("http://") || word.starts_with("https://") {
            out.push(Fragment {
                text: token.to_string(),
                class: CharClass::Url,
            });
            continue;
        }

        // CJK 逐字成片段，非 CJK 连续段落成词
        let mut run = String::new();
        let trailing = &token[word.len()..];
        for c in word.chars() {
            if is_cjk(c) {
                if !run.is_empty() {
                    out.push(classify_word(std::mem::take(&mut run)));
                }
                out.push(Fragment {
                    text: c.to_string(),
                    class: CharClass::Cjk,
                });
            } else {
                run.push(c);
            }
        }
        if !run.is_empty() {
            out.push(classify_word(run));
        }
        if let Some(last) = out.last_mut() {
            last.text.push_str(trailing);
        }
    }
    out
}

fn classify_word(word: String) -> Fragment {
    let class = if ends_with_break_punct(&word) {
        CharClass::Punct
    } else if word.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
        CharClass::Capital
    } else {
        CharClass::Word
    };
    Fragment { text: word, class }
}

/// 启动流式通道消费任务：EventStream → StreamChunk
pub fn spawn_stream_channel(
    mut stream: EventStream,
    out: mpsc::Sender<StreamChunk>,
    pacing: TypingPacing,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut streaming = true;
        while let Some(event) = stream.events.recv().await {
            match event {
                ResearchEvent::Step { think, urls, .. } => {
                    // 收尾后队列里残留的思考整条丢弃
                    if *stream.finalize.borrow() {
                        continue;
                    }
                    for url in urls {
                        if streaming && out.send(StreamChunk::Url { url }).await.is_err() {
                            streaming = false;
                        }
                    }
                    stream_think(&think, &mut streaming, &stream.finalize, &out, &pacing).await;
                }
                ResearchEvent::Final { report } => {
                    let _ = out.send(StreamChunk::ThinkingEnd).await;
                    let _ = out.send(StreamChunk::Answer(Box::new(report))).await;
                    break;
                }
                ResearchEvent::Error { text } => {
                    let _ = out.send(StreamChunk::ThinkingEnd).await;
                    let _ = out.send(StreamChunk::Error { text }).await;
                    break;
                }
            }
        }
    })
}

/// 配速吐出一条思考；finalize 置位时把剩余文本一次写完，断连时丢弃剩余
async fn stream_think(
    text: &str,
    streaming: &mut bool,
    finalize: &watch::Receiver<bool>,
    out: &mpsc::Sender<StreamChunk>,
    pacing: &TypingPacing,
) {
    let frags = fragments(text);
    let mut typing = TypingState::default();
    let mut i = 0;
    while i < frags.len() {
        if !*streaming {
            return;
        }
        if *finalize.borrow() {
            let rest: String = frags[i..].iter().map(|f| f.text.as_str()).collect();
            if out.send(StreamChunk::Think { text: rest }).await.is_err() {
                *streaming = false;
            }
            return;
        }
        let fragment = &frags[i];
        if out
            .send(StreamChunk::Think {
                text: fragment.text.clone(),
            })
            .await
            .is_err()
        {
            *streaming = false;
            return;
        }
        let delay = typing.next_delay(fragment, pacing);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        i += 1;
    }
    // 思考条目之间留一个空行
    if *streaming
        && out
            .send(StreamChunk::Think {
                text: "\n\n".to_string(),
            })
            .await
            .is_err()
    {
        *streaming = false;
    }
}

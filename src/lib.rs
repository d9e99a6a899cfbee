//! Nectar - 深度研究智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与 token 预算追踪
//! - **knowledge**: 请求内只追加的 Q/A 知识库
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、结构化输出
//! - **research**: 动作、状态、评估器与调度主循环
//! - **server**: chat-completions HTTP 服务与 SSE 流
//! - **stream**: 流式进度通道与自然打字配速
//! - **tools**: 外部协作方（搜索、抓取、沙箱、重排）
//! - **urls**: URL 规范化、去重仓库与排序

pub mod config;
pub mod core;
pub mod knowledge;
pub mod llm;
pub mod observability;
pub mod research;
pub mod server;
pub mod stream;
pub mod tools;
pub mod urls;

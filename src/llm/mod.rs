//! LLM 层：客户端抽象、OpenAI 兼容实现、结构化输出与测试用 Mock

pub mod mock;
pub mod object;
pub mod openai;
pub mod traits;

pub use mock::ScriptedLlm;
pub use object::{extract_json, generate_object, schema_of};
pub use openai::{CumulativeUsage, OpenAiClient};
pub use traits::{LlmClient, LlmError, LlmReply, LlmUsage, Message, Role};

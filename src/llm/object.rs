//! 结构化输出：Schema 注入与 JSON 解析
//!
//! 将 JSON Schema 拼入 system prompt，要求 LLM 只输出一个合法 JSON 对象；
//! 从回复文本中提取 JSON（```json 围栏或首个大括号块）并反序列化。
//! 解析失败时把错误回喂给 LLM 重试，最多 2 次。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::{AgentError, TokenTracker};
use crate::llm::{LlmClient, Message};

/// Schema 违例时的最大重试次数
const MAX_SCHEMA_RETRIES: usize = 2;

/// 由类型派生 JSON Schema（供 generate_object 的 schema 参数）
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| Value::Null)
}

/// 从 LLM 输出中提取 JSON 块（```json ... ``` 或首个 { 到最后一个 }）
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        Some(&trimmed[start..=end])
    } else {
        None
    }
}

/// 调用 LLM 并要求输出符合 schema 的 JSON 对象；用量按 tool 名计入 tracker
pub async fn generate_object<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    tracker: &TokenTracker,
    tool: &str,
    system: &str,
    messages: &[Message],
    schema: &Value,
) -> Result<T, AgentError> {
    let schema_text = serde_json::to_string_pretty(schema).unwrap_or_else(|_| "{}".to_string());
    let system = format!(
        "{system}\n\n## Response JSON Schema\n\
         You must respond with a single JSON object matching this schema. \
         No markdown, no prose outside the JSON.\n```json\n{schema_text}\n```"
    );

    let mut full: Vec<Message> = Vec::with_capacity(messages.len() + 1);
    full.push(Message::system(system));
    full.extend(messages.iter().cloned());

    let mut last_err = String::new();
    for attempt in 0..=MAX_SCHEMA_RETRIES {
        let reply = llm
            .complete(&full)
            .await
            .map_err(|e| AgentError::Llm(e.to_string()))?;
        tracker.track(tool, reply.usage.total());

        let parsed = extract_json(&reply.content)
            .ok_or_else(|| "no JSON object found in completion".to_string())
            .and_then(|json| serde_json::from_str::<T>(json).map_err(|e| e.to_string()));
        match parsed {
            Ok(object) => return Ok(object),
            Err(e) => {
                tracing::warn!(tool = tool, attempt, error = %e, "schema violation, retrying");
                last_err = e;
                full.push(Message::assistant(reply.content));
                full.push(Message::user(format!(
                    "Your previous output did not match the required JSON schema: {last_err}. \
                     Respond again with ONLY a single valid JSON object matching the schema."
                )));
            }
        }
    }
    Err(AgentError::SchemaViolation(last_err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Pick {
        choice: String,
    }

    #[test]
    fn test_extract_json_fenced() {
        let out = "Sure, here it is:\n```json\n{\"choice\": \"a\"}\n```\ndone";
        assert_eq!(extract_json(out), Some("{\"choice\": \"a\"}"));
    }

    #[test]
    fn test_extract_json_bare_braces() {
        let out = "thinking... {\"choice\": \"b\"} trailing";
        assert_eq!(extract_json(out), Some("{\"choice\": \"b\"}"));
    }

    #[test]
    fn test_extract_json_none() {
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn test_generate_object_retries_then_succeeds() {
        let llm = ScriptedLlm::new();
        llm.push("not json at all");
        llm.push("{\"wrong_field\": 1}");
        llm.push("{\"choice\": \"c\"}");

        let tracker = TokenTracker::new(10_000);
        let schema = schema_of::<Pick>();
        let picked: Pick = generate_object(&llm, &tracker, "test", "pick one", &[], &schema)
            .await
            .unwrap();
        assert_eq!(picked.choice, "c");
        assert_eq!(llm.calls(), 3);
        assert_eq!(tracker.total(), 300);
    }

    #[tokio::test]
    async fn test_generate_object_gives_up_after_retries() {
        let llm = ScriptedLlm::new();
        llm.push("still not json");

        let tracker = TokenTracker::new(10_000);
        let schema = schema_of::<Pick>();
        let result: Result<Pick, _> =
            generate_object(&llm, &tracker, "test", "pick one", &[], &schema).await;
        assert!(matches!(result, Err(AgentError::SchemaViolation(_))));
        assert_eq!(llm.calls(), 1 + MAX_SCHEMA_RETRIES);
    }
}

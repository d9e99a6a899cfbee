//! LLM-backed code sandbox.
//!
//! Asks the model to write a small self-contained program for the issue and
//! evaluate it against the provided context, returning both the code and the
//! computed output. A real executing sandbox can replace this behind the
//! CodeSandbox trait without touching the loop.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::core::{AgentError, TokenTracker};
use crate::llm::{generate_object, schema_of, LlmClient, Message};
use crate::tools::{CodeSandbox, CodeSolution};

#[derive(Debug, Deserialize, JsonSchema)]
struct SandboxReply {
    /// The program that solves the issue
    code: String,
    /// The result of evaluating the program against the context
    output: String,
}

pub struct LlmSandbox {
    llm: Arc<dyn LlmClient>,
    tracker: Arc<TokenTracker>,
}

impl LlmSandbox {
    pub fn new(llm: Arc<dyn LlmClient>, tracker: Arc<TokenTracker>) -> Self {
        Self { llm, tracker }
    }
}

#[async_trait]
impl CodeSandbox for LlmSandbox {
    async fn solve(&self, issue: &str, context: &str) -> Result<CodeSolution, AgentError> {
        let system = "You are a precise coding assistant. Write a short self-contained program \
                      that solves the issue using only the data in the context, then evaluate \
                      it step by step and report the final output exactly.";
        let prompt = format!("Issue: {issue}\n\nContext:\n{context}");
        let schema = schema_of::<SandboxReply>();
        let reply: SandboxReply = generate_object(
            self.llm.as_ref(),
            &self.tracker,
            "coding",
            system,
            &[Message::user(prompt)],
            &schema,
        )
        .await
        .map_err(|e| AgentError::Sandbox(e.to_string()))?;
        Ok(CodeSolution {
            code: reply.code,
            output: reply.output,
        })
    }
}

//! Lightweight lexical reranker.
//!
//! Self-contained fallback when no external reranking service is configured:
//! scores each candidate by token overlap with the question, which is often
//! good enough to improve URL ordering without network calls.

use async_trait::async_trait;

use crate::core::AgentError;
use crate::tools::Reranker;

fn tokenize(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for ch in s.chars() {
        let c = ch.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            cur.push(c);
        } else if !cur.is_empty() {
            if cur.len() >= 2 {
                out.push(cur.clone());
            }
            cur.clear();
        }
    }
    if !cur.is_empty() && cur.len() >= 2 {
        out.push(cur);
    }
    out.sort();
    out.dedup();
    out
}

fn overlap_score(query_toks: &[String], text_toks: &[String]) -> f32 {
    if query_toks.is_empty() || text_toks.is_empty() {
        return 0.0;
    }
    let mut i = 0usize;
    let mut j = 0usize;
    let mut inter = 0u64;
    while i < query_toks.len() && j < text_toks.len() {
        match query_toks[i].cmp(&text_toks[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                inter += 1;
                i += 1;
                j += 1;
            }
        }
    }
    // Normalize by query size so "covering the question" scores highly.
    inter as f32 / (query_toks.len() as f32)
}

/// Token-overlap reranker. Candidates are scored against the question text;
/// URLs carry signal in their path and title words.
#[derive(Debug, Default)]
pub struct LexicalReranker;

#[async_trait]
impl Reranker for LexicalReranker {
    async fn rerank(&self, question: &str, candidates: &[String]) -> Result<Vec<f32>, AgentError> {
        let q_toks = tokenize(question);
        Ok(candidates
            .iter()
            .map(|c| overlap_score(&q_toks, &tokenize(c)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relevant_candidate_scores_higher() {
        let reranker = LexicalReranker;
        let scores = reranker
            .rerank(
                "rust async runtime comparison",
                &[
                    "https://example.com/rust-async-runtime-benchmarks".to_string(),
                    "https://example.com/cooking-pasta".to_string(),
                ],
            )
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn test_empty_question_scores_zero() {
        let reranker = LexicalReranker;
        let scores = reranker
            .rerank("", &["https://example.com/a".to_string()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.0]);
    }
}

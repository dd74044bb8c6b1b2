use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::llm::prompt::{extract_delimited, sanitize_for_prompt, truncate_to_char_boundary};
use crate::llm::{RelevanceScorer, TextGenerator};
use crate::models::ChatMessage;

/// Parallel judgments per scoring call.
const MAX_CONCURRENT_JUDGMENTS: usize = 4;

/// Passage characters shown to the judge.
const MAX_PASSAGE_CHARS: usize = 1_500;

pub const SYSTEM_PROMPT: &str = "Judge whether the passage helps answer the question. \
Answer with ONLY a JSON object: {\"relevant\": true/false, \"confidence\": 0.0-1.0}";

/// Relevance scorer that asks the chat model for a yes/no judgment per
/// passage. Used when no cross-encoder endpoint is configured.
///
/// Scores land in 0-1: `relevant` contributes 0.5 and confidence the rest.
pub struct LlmJudgeScorer {
    generator: Arc<dyn TextGenerator>,
}

impl LlmJudgeScorer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl RelevanceScorer for LlmJudgeScorer {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_JUDGMENTS));
        let query = sanitize_for_prompt(query);

        let judgments = passages.iter().map(|passage| {
            let semaphore = semaphore.clone();
            let messages = vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(format!(
                    "Question: {query}\n\nPassage:\n{}",
                    sanitize_for_prompt(truncate_to_char_boundary(passage, MAX_PASSAGE_CHARS))
                )),
            ];
            async move {
                let _permit = semaphore.acquire().await?;
                let reply = self.generator.generate(messages).await?;
                Ok::<f32, anyhow::Error>(parse_relevance_score(&reply))
            }
        });

        // One failed judgment fails the whole set: a partially scored list
        // would rank unscored passages arbitrarily.
        futures_util::future::try_join_all(judgments).await
    }
}

#[derive(Deserialize)]
struct RelevanceResponse {
    relevant: bool,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    0.5
}

fn parse_relevance_score(content: &str) -> f32 {
    let parsed = serde_json::from_str::<RelevanceResponse>(content.trim()).ok().or_else(|| {
        extract_delimited(content, '{', '}')
            .and_then(|json| serde_json::from_str::<RelevanceResponse>(json).ok())
    });
    if let Some(v) = parsed {
        let base = if v.relevant { 0.5 } else { 0.0 };
        return base + v.confidence.clamp(0.0, 1.0) * 0.5;
    }

    // Fallback: leading yes/no keyword
    let lower = content.trim_start().to_lowercase();
    if lower.starts_with("yes") {
        0.7
    } else if lower.starts_with("no") {
        0.2
    } else {
        0.5
    }
}

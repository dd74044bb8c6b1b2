use serde::Deserialize;
use std::fmt::Write;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::llm::prompt::{extract_delimited, sanitize_for_prompt};
use crate::llm::TextGenerator;
use crate::models::ChatMessage;
use crate::pipeline::generator::is_insufficiency;
use crate::pipeline::reranker::RankedPassage;

pub const SYSTEM_PROMPT: &str = "You check answers against source passages. An answer is \
supported when every claim in it is backed by the passages. An answer that correctly says \
the passages do not contain the information is also supported. Respond with ONLY a JSON \
object: {\"supported\": true/false, \"reason\": \"one sentence\"}";

/// Judgment on whether an answer is backed by its passages.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub supported: bool,
    pub rationale: Option<String>,
}

impl Verdict {
    fn unsupported(rationale: impl Into<String>) -> Self {
        Self {
            supported: false,
            rationale: Some(rationale.into()),
        }
    }
}

/// Second-opinion check of a generated answer. Fails closed: anything short
/// of a clear "supported" is a rejection.
pub struct AnswerValidator {
    generator: Arc<dyn TextGenerator>,
}

impl AnswerValidator {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub async fn validate(&self, query: &str, answer: &str, passages: &[RankedPassage]) -> Verdict {
        if passages.is_empty() {
            // Nothing to check claims against; only a decline can be right
            return if is_insufficiency(answer) {
                Verdict {
                    supported: true,
                    rationale: Some("No passages were retrieved and the answer declines".into()),
                }
            } else {
                Verdict::unsupported("No passages were retrieved to support the answer")
            };
        }

        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_prompt(query, answer, passages)),
        ];

        let verdict = match self.generator.generate(messages).await {
            Ok(reply) => parse_verdict(&reply),
            Err(e) => Err(PipelineError::ValidationInconclusive(format!("{e:#}"))),
        };

        match verdict {
            Ok(v) => {
                tracing::info!(supported = v.supported, "validate");
                v
            }
            Err(e) => {
                tracing::warn!(error = %e, "Treating answer as unsupported");
                Verdict::unsupported(e.to_string())
            }
        }
    }
}

fn build_prompt(query: &str, answer: &str, passages: &[RankedPassage]) -> String {
    let mut prompt = String::from("Passages:\n\n");
    for (i, p) in passages.iter().enumerate() {
        let _ = write!(prompt, "[{}] {}\n\n", i + 1, sanitize_for_prompt(&p.chunk.content));
    }
    let _ = write!(
        prompt,
        "---\nQuestion: {}\n\nAnswer to check:\n{}",
        sanitize_for_prompt(query),
        sanitize_for_prompt(answer)
    );
    prompt
}

#[derive(Deserialize)]
struct VerdictReply {
    #[serde(alias = "is_correct")]
    supported: bool,
    #[serde(default)]
    reason: Option<String>,
}

fn parse_verdict(reply: &str) -> Result<Verdict, PipelineError> {
    let json = extract_delimited(reply, '{', '}').unwrap_or(reply);
    if let Ok(v) = serde_json::from_str::<VerdictReply>(json) {
        return Ok(Verdict {
            supported: v.supported,
            rationale: v.reason.filter(|r| !r.trim().is_empty()),
        });
    }

    let lower = reply.trim_start().to_lowercase();
    let affirmative = lower.starts_with("yes") || lower.starts_with("supported");
    let negated = ["not", "unsupported", "no "].iter().any(|n| lower.contains(n));
    if affirmative && !negated {
        return Ok(Verdict {
            supported: true,
            rationale: None,
        });
    }

    Err(PipelineError::ValidationInconclusive(format!(
        "unparseable verdict: {}",
        reply.chars().take(120).collect::<String>()
    )))
}

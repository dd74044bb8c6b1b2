use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::llm::prompt::sanitize_for_prompt;
use crate::llm::TextGenerator;
use crate::models::{ChatMessage, Fragment, SourceRef};
use crate::pipeline::reranker::RankedPassage;

/// The answer a grounded prompt asks for when the passages fall short.
pub const INSUFFICIENT_ANSWER: &str = "I cannot find this information in the provided documents.";

pub const GROUNDED_PROMPT: &str = "You answer questions using ONLY the numbered document \
passages in the user message. Never use outside knowledge. Cite the passages you rely on \
with their markers, e.g. [1] or [2][3]. If the passages do not contain the answer, reply \
exactly: \"I cannot find this information in the provided documents.\"";

pub const DIRECT_PROMPT: &str = "You are a helpful assistant. Answer the question clearly \
and concisely.";

/// Phrases that mark an answer as a statement of insufficiency.
const DECLINE_MARKERS: &[&str] = &[
    "cannot find this information",
    "can't find this information",
    "do not contain",
    "does not contain",
    "don't contain",
    "doesn't contain",
    "not mentioned in the provided",
    "no information about",
];

const IDLE_TIMEOUT_SECS: u64 = 30;

/// Whether an answer declines for lack of evidence.
///
/// The canonical reply always counts. A decline phrase only counts in an
/// answer with no citation markers: "Water does not contain calories [1]."
/// is a grounded claim, not a refusal.
pub fn is_insufficiency(answer: &str) -> bool {
    let answer = answer.trim();
    if answer.eq_ignore_ascii_case(INSUFFICIENT_ANSWER) {
        return true;
    }
    citation_markers(answer).is_empty() && has_decline_phrase(answer)
}

fn has_decline_phrase(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    DECLINE_MARKERS.iter().any(|m| lower.contains(m))
}

/// What the generator is asked to answer.
#[derive(Debug, Clone, Copy)]
pub struct AnswerRequest<'a> {
    pub query: &'a str,
    pub passages: &'a [RankedPassage],
    pub max_sentences: Option<usize>,
    /// Grounded prompts demand citations and an explicit decline; ungrounded
    /// ones answer from the model's own knowledge.
    pub grounded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
}

/// How an incremental generation ended.
#[derive(Debug)]
pub enum Streamed {
    Completed(Answer),
    /// The consumer went away or the token fired; nothing more was sent.
    Cancelled,
}

pub struct AnswerGenerator {
    generator: Arc<dyn TextGenerator>,
    idle_timeout: Duration,
}

impl AnswerGenerator {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
        }
    }

    /// Longest silence tolerated between streamed fragments.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub async fn generate(&self, req: AnswerRequest<'_>) -> Result<Answer> {
        if req.grounded && req.passages.is_empty() {
            return Ok(declined());
        }

        let text = self
            .generator
            .generate(build_messages(&req))
            .await
            .map_err(PipelineError::generation)?;

        finish(text, &req)
    }

    /// Generate incrementally, sending each piece as [`Fragment::AnswerChunk`]
    /// tagged with `attempt`.
    ///
    /// Cancellation (token or a closed channel) is observed between pieces;
    /// the model stream is dropped as soon as it is seen.
    pub async fn generate_stream(
        &self,
        req: AnswerRequest<'_>,
        attempt: u32,
        tx: &mpsc::Sender<Fragment>,
        cancel: &CancellationToken,
    ) -> Result<Streamed> {
        if req.grounded && req.passages.is_empty() {
            let answer = declined();
            let chunk = Fragment::AnswerChunk {
                content: answer.text.clone(),
                attempt,
            };
            if !send(tx, cancel, chunk).await {
                return Ok(Streamed::Cancelled);
            }
            return Ok(Streamed::Completed(answer));
        }

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Streamed::Cancelled),
            s = self.generator.generate_stream(build_messages(&req)) => {
                s.map_err(PipelineError::generation)?
            }
        };

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Streamed::Cancelled),
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };

            match next {
                Ok(Some(Ok(piece))) => {
                    if piece.is_empty() {
                        continue;
                    }
                    text.push_str(&piece);
                    let chunk = Fragment::AnswerChunk {
                        content: piece,
                        attempt,
                    };
                    if !send(tx, cancel, chunk).await {
                        return Ok(Streamed::Cancelled);
                    }
                }
                Ok(Some(Err(e))) => return Err(PipelineError::generation(e)),
                Ok(None) => break,
                Err(_) => {
                    return Err(PipelineError::GenerationFailure(format!(
                        "model stream idle for {}s",
                        self.idle_timeout.as_secs()
                    )))
                }
            }
        }

        finish(text, &req).map(Streamed::Completed)
    }
}

/// False when the fragment could not be delivered.
async fn send(tx: &mpsc::Sender<Fragment>, cancel: &CancellationToken, fragment: Fragment) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(fragment) => sent.is_ok(),
    }
}

fn declined() -> Answer {
    Answer {
        text: INSUFFICIENT_ANSWER.to_string(),
        sources: Vec::new(),
    }
}

fn finish(text: String, req: &AnswerRequest<'_>) -> Result<Answer> {
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(PipelineError::GenerationFailure(
            "model returned an empty answer".to_string(),
        ));
    }
    let sources = sources_used(&text, req.passages);
    tracing::info!(answer_length = text.len(), sources = sources.len(), "generate");
    Ok(Answer { text, sources })
}

/// Passages the answer cites with `[n]`; every passage if it cites none.
/// A decline uses nothing.
fn sources_used(answer: &str, passages: &[RankedPassage]) -> Vec<SourceRef> {
    if passages.is_empty() {
        return Vec::new();
    }

    let cited: BTreeSet<usize> = citation_markers(answer)
        .into_iter()
        .filter(|n| (1..=passages.len()).contains(n))
        .collect();

    if !cited.is_empty() {
        cited
            .into_iter()
            .map(|n| passages[n - 1].chunk.source_ref())
            .collect()
    } else if has_decline_phrase(answer) {
        // No usable citation left, so the phrase is the whole story
        Vec::new()
    } else {
        passages.iter().map(|p| p.chunk.source_ref()).collect()
    }
}

/// Numbers inside `[n]` markers, in order of appearance. Also reads `[1, 2]`.
fn citation_markers(text: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find(']') else { break };
        let inner = &rest[..close];
        let numbers: Option<Vec<usize>> = inner
            .split(',')
            .map(|n| n.trim().parse::<usize>().ok())
            .collect();
        if let Some(numbers) = numbers {
            out.extend(numbers);
        }
        rest = &rest[close + 1..];
    }
    out
}

fn build_messages(req: &AnswerRequest<'_>) -> Vec<ChatMessage> {
    let query = sanitize_for_prompt(req.query);
    let mut user = String::new();

    if req.grounded {
        user.push_str("Document passages:\n\n");
        for (i, p) in req.passages.iter().enumerate() {
            let _ = write!(
                user,
                "[{}] ({}, page {})\n{}\n\n",
                i + 1,
                p.chunk.filename,
                p.chunk.page + 1,
                sanitize_for_prompt(&p.chunk.content)
            );
        }
        user.push_str("---\n");
    }
    let _ = write!(user, "Question: {query}");
    if let Some(n) = req.max_sentences {
        let _ = write!(user, "\n\nAnswer in at most {n} sentence(s).");
    }

    let system = if req.grounded { GROUNDED_PROMPT } else { DIRECT_PROMPT };
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

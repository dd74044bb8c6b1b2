//! Deterministic stand-ins for the model capabilities.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use uuid::Uuid;

use rag_agent::config::PipelineConfig;
use rag_agent::llm::{Embedder, RelevanceScorer, TextGenerator, TextStream};
use rag_agent::models::{ChatMessage, Chunk};
use rag_agent::pipeline::generator::{DIRECT_PROMPT, GROUNDED_PROMPT, INSUFFICIENT_ANSWER};
use rag_agent::pipeline::{rewriter, validator, Capabilities, Pipeline};
use rag_agent::search::corpus::Corpus;

const DIM: usize = 64;

/// Bag-of-words embedding: each lowercase word bumps one hashed bucket.
pub struct HashEmbedder {
    pub fail: AtomicBool,
    /// Milliseconds each call sleeps before answering
    pub delay_ms: AtomicU64,
}

impl HashEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        })
    }
}

pub fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for word in words(text) {
        // FNV-1a
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIM as u64) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("embedding service down");
        }
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

/// Relevance = number of query words found in the passage.
pub struct OverlapScorer {
    pub fail: bool,
}

#[async_trait]
impl RelevanceScorer for OverlapScorer {
    async fn score(&self, query: &str, passages: &[String]) -> anyhow::Result<Vec<f32>> {
        if self.fail {
            anyhow::bail!("reranker unreachable");
        }
        let query_words: Vec<String> = words(query).collect();
        Ok(passages
            .iter()
            .map(|p| {
                let passage_words: Vec<String> = words(p).collect();
                query_words.iter().filter(|w| passage_words.contains(w)).count() as f32
            })
            .collect())
    }
}

/// Chat model that routes on the system prompt each stage sends.
///
/// - rewrite: `rewrites` as a JSON array (or an error when `fail_rewrite`)
/// - grounded answer: cites passage [1] when it shares a word with the
///   question, otherwise declines
/// - direct answer: a fixed sentence
/// - validation: pops `verdicts`, defaulting to supported
pub struct ScriptedModel {
    pub rewrites: Vec<String>,
    pub fail_rewrite: bool,
    pub fail_answer: bool,
    /// Streamed answers emit one word and then hang
    pub stall_stream: bool,
    pub verdicts: Mutex<VecDeque<bool>>,
    pub rewrite_prompts: Mutex<Vec<String>>,
    pub answer_calls: AtomicUsize,
    pub validate_calls: AtomicUsize,
    pub stream_dropped: Arc<AtomicBool>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            rewrites: vec!["advantages of physical activity".into(), "why work out".into()],
            fail_rewrite: false,
            fail_answer: false,
            stall_stream: false,
            verdicts: Mutex::new(VecDeque::new()),
            rewrite_prompts: Mutex::new(Vec::new()),
            answer_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ScriptedModel {
    pub fn with_verdicts(verdicts: &[bool]) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.iter().copied().collect()),
            ..Self::default()
        }
    }

    pub fn rewrite_calls(&self) -> usize {
        self.rewrite_prompts.lock().len()
    }

    pub fn answer_calls(&self) -> usize {
        self.answer_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    fn reply(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let system = messages[0].content.as_str();
        let user = messages[1].content.as_str();

        if system == rewriter::SYSTEM_PROMPT {
            self.rewrite_prompts.lock().push(user.to_string());
            if self.fail_rewrite {
                anyhow::bail!("rewrite model offline");
            }
            return Ok(serde_json::to_string(&self.rewrites)?);
        }

        if system == validator::SYSTEM_PROMPT {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            let supported = self.verdicts.lock().pop_front().unwrap_or(true);
            return Ok(format!(
                "{{\"supported\": {supported}, \"reason\": \"scripted verdict\"}}"
            ));
        }

        if system == GROUNDED_PROMPT || system == DIRECT_PROMPT {
            self.answer_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_answer {
                anyhow::bail!("model returned 500");
            }
            if system == DIRECT_PROMPT {
                return Ok("A direct answer without documents.".to_string());
            }
            return Ok(grounded_answer(user));
        }

        anyhow::bail!("unexpected system prompt: {system}")
    }
}

/// Cite passage [1] when it shares a content word with the question.
fn grounded_answer(user: &str) -> String {
    let question = user.rsplit("Question: ").next().unwrap_or_default();
    let question = question.split("\n\n").next().unwrap_or_default();
    let first_passage = user
        .split("[1] ")
        .nth(1)
        .and_then(|rest| rest.split("\n\n").next())
        .and_then(|block| block.split_once('\n').map(|(_, text)| text))
        .unwrap_or_default();

    let passage_words: Vec<String> = words(first_passage).collect();
    let overlaps = words(question)
        .filter(|w| w.len() > 3)
        .any(|w| passage_words.contains(&w));
    if overlaps {
        format!("{} [1]", first_passage.trim())
    } else {
        INSUFFICIENT_ANSWER.to_string()
    }
}

#[async_trait]
impl TextGenerator for ScriptedModel {
    async fn generate(&self, messages: Vec<ChatMessage>) -> anyhow::Result<String> {
        self.reply(&messages)
    }

    async fn generate_stream(&self, messages: Vec<ChatMessage>) -> anyhow::Result<TextStream> {
        let text = self.reply(&messages)?;
        let pieces: Vec<anyhow::Result<String>> = text
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();

        let flag = DropFlag(self.stream_dropped.clone());
        if self.stall_stream {
            let first: Vec<_> = pieces.into_iter().take(1).collect();
            let s = stream::iter(first).chain(stream::pending()).map(move |piece| {
                let _flag = &flag;
                piece
            });
            return Ok(Box::pin(s));
        }
        let s = stream::iter(pieces).map(move |piece| {
            let _flag = &flag;
            piece
        });
        Ok(Box::pin(s))
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

// ─── Fixtures ────────────────────────────────────────────

pub const EXERCISE_PAGES: &[&str] = &[
    "Regular exercise strengthens the heart and improves cardiovascular health. \
     Exercise also lowers blood pressure.",
    "Benefits of exercise include better sleep, improved mood and stronger bones.",
];

pub const BREAD_PAGES: &[&str] = &["Bread is baked from flour, water, salt and yeast."];

pub fn page_chunks(document_id: Uuid, filename: &str, pages: &[&str]) -> Vec<Chunk> {
    pages
        .iter()
        .enumerate()
        .map(|(page, text)| Chunk {
            document_id,
            filename: filename.to_string(),
            page,
            chunk_index: 0,
            content: text.to_string(),
        })
        .collect()
}

pub async fn add(corpus: &Corpus, chunks: Vec<Chunk>) {
    let embeddings = chunks.iter().map(|c| embed_text(&c.content)).collect();
    corpus.add_document(chunks, embeddings).await.unwrap();
}

/// Corpus with the exercise and bread documents. Returns their ids.
pub async fn sample_corpus() -> (Corpus, Uuid, Uuid) {
    let corpus = Corpus::in_memory().unwrap();
    let health = Uuid::new_v4();
    let bread = Uuid::new_v4();
    add(&corpus, page_chunks(health, "health.pdf", EXERCISE_PAGES)).await;
    add(&corpus, page_chunks(bread, "bread.pdf", BREAD_PAGES)).await;
    (corpus, health, bread)
}

pub fn pipeline(
    corpus: Corpus,
    model: Arc<ScriptedModel>,
    scorer_fails: bool,
    config: PipelineConfig,
) -> Pipeline {
    Pipeline::new(
        corpus,
        Capabilities {
            generator: model,
            embedder: HashEmbedder::new(),
            scorer: Arc::new(OverlapScorer { fail: scorer_fails }),
        },
        config,
    )
}

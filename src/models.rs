use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PipelineConfig;

/// An indexed document. Owns 1..N chunks in both indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub chunk_count: usize,
}

/// A single indexed chunk of document text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: Uuid,
    pub filename: String,
    /// 0-based page the text came from
    pub page: usize,
    /// 0-based position within the page
    pub chunk_index: usize,
    pub content: String,
}

impl Chunk {
    /// Stable id, unique within the owning document.
    pub fn id(&self) -> String {
        format!("{}_p{}_c{}", self.filename, self.page, self.chunk_index)
    }

    /// Ordering key used for deterministic tie-breaking.
    pub fn key(&self) -> ChunkKey {
        (self.document_id, self.page, self.chunk_index)
    }

    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            document_id: self.document_id,
            filename: self.filename.clone(),
            page: self.page,
            chunk_id: self.id(),
        }
    }
}

/// (document id, page, chunk index)
pub type ChunkKey = (Uuid, usize, usize);

/// Source reference returned with an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: Uuid,
    pub filename: String,
    pub page: usize,
    pub chunk_id: String,
}

/// How a query is answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Rewrite, hybrid retrieval, rerank, generate, validate, retry.
    #[default]
    Agentic,
    /// Original query, vector-only retrieval, streamed generation. No correction loop.
    Fast,
    /// Generation only, no passages and no validation.
    Direct,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Agentic => "agentic",
            QueryMode::Fast => "fast",
            QueryMode::Direct => "direct",
        }
    }
}

/// Query request
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub mode: QueryMode,
    /// Optional answer length limit
    pub max_sentences: Option<usize>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Per-request overrides of the pipeline tunables, capped at the server's
    pub pipeline: Option<PipelineConfig>,
}

fn default_true() -> bool {
    true
}

/// Complete result of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// True when at least one retry fired
    pub was_corrected: bool,
    /// False when the answer never passed validation (or was not validated in agentic mode)
    pub validated: bool,
    /// Generation attempts performed
    pub attempts: u32,
    pub response_time_ms: f64,
    pub cache_hit: bool,
    pub mode: QueryMode,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub num_rewritten_queries: usize,
    pub num_retrieved: usize,
    pub num_ranked: usize,
    /// Top re-ranker score of the final attempt, if re-ranking ran
    pub retrieval_score: Option<f32>,
    pub validation_reason: Option<String>,
    pub rewrite_degraded: bool,
    pub rerank_degraded: bool,
}

/// One element of an incremental answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    /// A piece of answer text from the given attempt.
    AnswerChunk { content: String, attempt: u32 },
    /// The previous attempt failed validation; text from it should be discarded.
    Correction { attempt: u32, reason: String },
    /// Final fragment of a successful stream.
    Metadata(StreamMetadata),
    /// Typed failure; no metadata follows.
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub sources: Vec<SourceRef>,
    pub was_corrected: bool,
    pub validated: bool,
    pub attempts: u32,
    pub response_time_ms: f64,
    pub cache_hit: bool,
    pub mode: QueryMode,
}

impl From<&QueryResult> for StreamMetadata {
    fn from(r: &QueryResult) -> Self {
        Self {
            sources: r.sources.clone(),
            was_corrected: r.was_corrected,
            validated: r.validated,
            attempts: r.attempts,
            response_time_ms: r.response_time_ms,
            cache_hit: r.cache_hit,
            mode: r.mode,
        }
    }
}

/// Add-document request. Text is already extracted, one entry per page.
#[derive(Debug, Clone, Deserialize)]
pub struct AddDocumentRequest {
    pub filename: String,
    pub pages: Vec<String>,
}

/// A single chat turn sent to the generation capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

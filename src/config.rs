use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where index data and the document registry are stored
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub llm: LlmConfig,
    pub reranker: RerankerConfig,
    /// Retrieval / correction tunables handed to every pipeline run
    pub pipeline: PipelineConfig,
    /// Words per chunk at ingestion time
    pub chunk_size: usize,
    /// Words shared between consecutive chunks
    pub chunk_overlap: usize,
    /// Result cache entry lifetime in seconds (0 disables caching)
    pub cache_ttl_secs: u64,
    /// Maximum cached results
    pub cache_capacity: usize,
    /// Maximum pipeline runs in flight
    pub max_concurrent_queries: usize,
}

/// Optional `/v1/rerank` endpoint. Without one, the chat model judges relevance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Per-request timeout, at most 30s
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `ollama` or `openai`
    pub provider: String,
    pub base_url: String,
    /// Serves rewriting, generation, validation and the relevance judge
    pub chat_model: String,
    pub embedding_model: String,
    /// Bearer token for OpenAI-compatible servers
    pub api_key: Option<String>,
    /// Vectors of any other length are rejected
    pub embedding_dim: usize,
}

/// Tunables for one pipeline run.
///
/// Passed into the pipeline at construction and optionally overridden per
/// request, so concurrent queries with different settings never share
/// mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Vector hits fetched per query variant
    pub top_k_vector: usize,
    /// Lexical hits fetched per query variant
    pub top_k_lexical: usize,
    /// Size of the fused candidate list handed to the re-ranker
    pub fused_limit: usize,
    /// Passages kept after re-ranking
    pub top_k_rerank: usize,
    /// RRF smoothing constant
    pub rank_constant: f32,
    /// Query variants produced by the rewriter (original included)
    pub num_query_variations: usize,
    /// Extra attempts after the first when validation fails
    pub max_retries: u32,
    /// Retrieval widening per retry (added to every top-k, times the retry number)
    pub widen_step: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k_vector: 20,
            top_k_lexical: 10,
            fused_limit: 20,
            top_k_rerank: 5,
            rank_constant: 60.0,
            num_query_variations: 3,
            max_retries: 2,
            widen_step: 5,
        }
    }
}

impl PipelineConfig {
    /// Retrieval widths for the given retry number (0 for the first attempt).
    pub fn widened(&self, retry: u32) -> Self {
        let extra = self.widen_step.saturating_mul(retry as usize);
        Self {
            top_k_vector: self.top_k_vector.saturating_add(extra),
            top_k_lexical: self.top_k_lexical.saturating_add(extra),
            fused_limit: self.fused_limit.saturating_add(extra),
            ..self.clone()
        }
    }

    /// A per-request override capped at the server's own settings.
    ///
    /// Callers may ask for less work than the server is configured for,
    /// never more. A non-positive or non-finite RRF constant falls back to
    /// the server's.
    pub fn bounded_by(&self, limit: &PipelineConfig) -> Self {
        let rank_constant = if self.rank_constant.is_finite() && self.rank_constant > 0.0 {
            self.rank_constant
        } else {
            limit.rank_constant
        };
        Self {
            top_k_vector: self.top_k_vector.min(limit.top_k_vector),
            top_k_lexical: self.top_k_lexical.min(limit.top_k_lexical),
            fused_limit: self.fused_limit.min(limit.fused_limit),
            top_k_rerank: self.top_k_rerank.min(limit.top_k_rerank),
            rank_constant,
            num_query_variations: self.num_query_variations.min(limit.num_query_variations),
            max_retries: self.max_retries.min(limit.max_retries),
            widen_step: self.widen_step.min(limit.widen_step),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8000".to_string(),
            llm: LlmConfig::default(),
            reranker: RerankerConfig::default(),
            pipeline: PipelineConfig::default(),
            chunk_size: 512,
            chunk_overlap: 50,
            cache_ttl_secs: 3600,
            cache_capacity: 1024,
            max_concurrent_queries: 4,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            chat_model: "phi3:mini".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            api_key: None,
            embedding_dim: 768,
        }
    }
}

/// Overwrite `slot` when `key` is set and parses; malformed values are ignored.
fn override_from_env<T: std::str::FromStr>(slot: &mut T, key: &str) {
    if let Some(value) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
        *slot = value;
    }
}

fn optional_from_env(slot: &mut Option<String>, key: &str) {
    if let Ok(value) = std::env::var(key) {
        *slot = Some(value);
    }
}

impl Config {
    /// Defaults overlaid with `RAG_*`, `LLM_*` and `RERANKER_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        override_from_env(&mut config.data_dir, "RAG_DATA_DIR");
        override_from_env(&mut config.bind_addr, "RAG_BIND_ADDR");
        override_from_env(&mut config.chunk_size, "RAG_CHUNK_SIZE");
        override_from_env(&mut config.chunk_overlap, "RAG_CHUNK_OVERLAP");
        override_from_env(&mut config.cache_ttl_secs, "RAG_CACHE_TTL_SECS");
        override_from_env(&mut config.cache_capacity, "RAG_CACHE_CAPACITY");
        override_from_env(&mut config.max_concurrent_queries, "RAG_MAX_CONCURRENT_QUERIES");

        let llm = &mut config.llm;
        override_from_env(&mut llm.provider, "LLM_PROVIDER");
        override_from_env(&mut llm.base_url, "LLM_BASE_URL");
        override_from_env(&mut llm.chat_model, "LLM_CHAT_MODEL");
        override_from_env(&mut llm.embedding_model, "LLM_EMBEDDING_MODEL");
        override_from_env(&mut llm.embedding_dim, "LLM_EMBEDDING_DIM");
        optional_from_env(&mut llm.api_key, "LLM_API_KEY");

        let reranker = &mut config.reranker;
        optional_from_env(&mut reranker.base_url, "RERANKER_BASE_URL");
        optional_from_env(&mut reranker.model, "RERANKER_MODEL");
        override_from_env(&mut reranker.timeout_secs, "RERANKER_TIMEOUT_SECS");
        reranker.timeout_secs = reranker.timeout_secs.min(30);

        let p = &mut config.pipeline;
        override_from_env(&mut p.top_k_vector, "RAG_TOP_K_VECTOR");
        override_from_env(&mut p.top_k_lexical, "RAG_TOP_K_LEXICAL");
        override_from_env(&mut p.fused_limit, "RAG_FUSED_LIMIT");
        override_from_env(&mut p.top_k_rerank, "RAG_TOP_K_RERANK");
        override_from_env(&mut p.num_query_variations, "RAG_NUM_QUERY_VARIATIONS");
        override_from_env(&mut p.max_retries, "RAG_MAX_RETRIES");
        override_from_env(&mut p.widen_step, "RAG_WIDEN_STEP");

        config
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("documents.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let p = PipelineConfig::default();
        assert_eq!(p.num_query_variations, 3);
        assert_eq!(p.max_retries, 2);
        assert_eq!(p.fused_limit, 20);
        assert_eq!(p.top_k_rerank, 5);
        assert_eq!(p.rank_constant, 60.0);
    }

    #[test]
    fn test_widened_first_attempt_is_unchanged() {
        let p = PipelineConfig::default();
        assert_eq!(p.widened(0), p);
    }

    #[test]
    fn test_widened_grows_linearly_with_retry() {
        let p = PipelineConfig::default();
        let w = p.widened(2);
        assert_eq!(w.top_k_vector, p.top_k_vector + 10);
        assert_eq!(w.top_k_lexical, p.top_k_lexical + 10);
        assert_eq!(w.fused_limit, p.fused_limit + 10);
        // Non-width settings untouched
        assert_eq!(w.top_k_rerank, p.top_k_rerank);
        assert_eq!(w.max_retries, p.max_retries);
    }

    #[test]
    fn test_widened_saturates_on_extreme_step() {
        let p = PipelineConfig {
            top_k_vector: usize::MAX,
            widen_step: usize::MAX,
            ..PipelineConfig::default()
        };
        let w = p.widened(u32::MAX);
        assert_eq!(w.top_k_vector, usize::MAX);
        assert_eq!(w.top_k_lexical, usize::MAX);
        assert_eq!(w.fused_limit, usize::MAX);
    }

    #[test]
    fn test_override_capped_at_server_settings() {
        let server = PipelineConfig::default();
        let requested = PipelineConfig {
            top_k_vector: 10_000,
            top_k_lexical: 3,
            fused_limit: usize::MAX,
            top_k_rerank: 1_000,
            rank_constant: 20.0,
            num_query_variations: 50,
            max_retries: 40,
            widen_step: usize::MAX,
        };
        let bounded = requested.bounded_by(&server);
        assert_eq!(bounded.max_retries, server.max_retries);
        assert_eq!(bounded.num_query_variations, server.num_query_variations);
        assert_eq!(bounded.top_k_vector, server.top_k_vector);
        assert_eq!(bounded.fused_limit, server.fused_limit);
        assert_eq!(bounded.top_k_rerank, server.top_k_rerank);
        assert_eq!(bounded.widen_step, server.widen_step);
        // Smaller requests are honoured
        assert_eq!(bounded.top_k_lexical, 3);
        assert_eq!(bounded.rank_constant, 20.0);
    }

    #[test]
    fn test_override_rejects_degenerate_rank_constant() {
        let server = PipelineConfig::default();
        for bad in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            let requested = PipelineConfig {
                rank_constant: bad,
                ..PipelineConfig::default()
            };
            assert_eq!(requested.bounded_by(&server).rank_constant, server.rank_constant);
        }
    }

    #[test]
    fn test_partial_pipeline_override_fills_defaults() {
        let p: PipelineConfig = serde_json::from_str(r#"{"max_retries": 0}"#).unwrap();
        assert_eq!(p.max_retries, 0);
        assert_eq!(p.top_k_vector, 20);
    }
}

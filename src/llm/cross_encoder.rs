//! Cross-encoder relevance scoring via an OpenAI-compatible `/v1/rerank`
//! endpoint (llama-server, TEI, vLLM).
//!
//! One batch request scores every (query, passage) pair, so re-ranking twenty
//! candidates costs a single round trip.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RerankerConfig;
use crate::llm::RelevanceScorer;

#[derive(Clone)]
pub struct CrossEncoderClient {
    client: reqwest::Client,
    config: RerankerConfig,
}

impl CrossEncoderClient {
    pub fn new(client: reqwest::Client, config: RerankerConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl RelevanceScorer for CrossEncoderClient {
    /// Scores come back in the caller's passage order, sigmoid-normalized to 0-1.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let base_url = self
            .config
            .base_url
            .as_deref()
            .context("Reranker base_url not configured")?;
        let model = self.config.model.as_deref().unwrap_or("default");
        let url = format!("{}/v1/rerank", base_url.trim_end_matches('/'));

        let req_body = RerankRequest {
            model: model.to_string(),
            query: query.to_string(),
            documents: passages.to_vec(),
            // Ask for everything; ordering is applied by the caller
            top_n: passages.len(),
        };

        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs.min(30)))
            .json(&req_body)
            .send()
            .await
            .context("Failed to reach reranker endpoint")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Reranker returned {status}: {body}");
        }

        let body: RerankResponse = resp
            .json()
            .await
            .context("Failed to parse reranker response")?;

        scores_in_input_order(body.results, passages.len())
    }
}

/// Map index-addressed results back to a dense vector. Every passage must be scored.
fn scores_in_input_order(results: Vec<RerankResultRaw>, n: usize) -> Result<Vec<f32>> {
    let mut scores = vec![None; n];
    for r in results {
        let slot = scores
            .get_mut(r.index)
            .with_context(|| format!("Reranker returned out-of-range index {}", r.index))?;
        *slot = Some(sigmoid(r.relevance_score));
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.with_context(|| format!("Reranker returned no score for passage {i}")))
        .collect()
}

/// Sigmoid normalization: maps raw logits to 0-1 range.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ─── Request/Response types ────────────────────────────

#[derive(Serialize)]
struct RerankRequest {
    model: String,
    query: String,
    documents: Vec<String>,
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRaw>,
}

#[derive(Deserialize)]
struct RerankResultRaw {
    index: usize,
    relevance_score: f32,
}

//! Model capabilities the pipeline depends on, plus HTTP implementations for
//! Ollama and OpenAI-compatible servers.
//!
//! The pipeline only ever sees the traits below, so any provider (or a test
//! fake) can be plugged in.

pub mod chat;
pub mod chat_stream;
pub mod cross_encoder;
pub mod embeddings;
pub mod judge;
pub mod prompt;

use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::Stream;

use crate::models::ChatMessage;

/// Incremental text fragments. Dropping the stream cancels the request.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Text generation, atomic or incremental.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, messages: Vec<ChatMessage>) -> Result<String>;

    async fn generate_stream(&self, messages: Vec<ChatMessage>) -> Result<TextStream>;
}

/// Text to fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .context("No embedding returned")
    }
}

/// Joint (query, passage) relevance scoring.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// One score per passage, in input order. Higher is more relevant.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;
}

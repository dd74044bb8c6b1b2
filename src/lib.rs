//! # rag-agent
//!
//! A question answering service over a private document collection. Answers
//! are generated from retrieved passages and checked by a second model call;
//! unsupported answers trigger another round with wider retrieval.
//!
//! ## Architecture
//!
//! One query runs through a bounded correction loop:
//!
//! ```text
//!                          ┌─────────────┐
//!                          │  User Query  │
//!                          └──────┬───────┘
//!                                 │
//!                                 ▼
//!                    ┌────────────────────────┐
//!              ┌────▶│     Query Rewriter     │◀─── rejected answer
//!              │     │ original + k-1 variants │     (negative context)
//!              │     └───────────┬────────────┘
//!              │                 │ k variants
//!              │      ┌──────────┴──────────┐
//!              │      ▼                     ▼
//!              │ ┌──────────┐         ┌──────────┐
//!              │ │   BM25   │   ...   │  Vector  │   per variant,
//!              │ │ (tantivy)│         │ (cosine) │   concurrently
//!              │ └────┬─────┘         └────┬─────┘
//!              │      └──────────┬──────────┘
//!              │                 ▼
//!              │     ┌────────────────────────┐
//!              │     │       RRF Fusion       │
//!              │     │  Σ 1/(60 + rank)       │
//!              │     └───────────┬────────────┘
//!              │                 ▼
//!              │     ┌────────────────────────┐
//!              │     │       Re-ranker        │
//!              │     │ cross-encoder or judge │
//!              │     └───────────┬────────────┘
//!              │                 ▼ top N passages
//!              │     ┌────────────────────────┐
//!              │     │    Answer Generator    │──▶ answer chunks
//!              │     └───────────┬────────────┘
//!              │                 ▼
//!              │     ┌────────────────────────┐
//!              │     │    Answer Validator    │
//!              │     └───────────┬────────────┘
//!              │     unsupported │ supported, or retries spent
//!              └─────────────────┤
//!                 (widen top-k)  ▼
//!                          ┌───────────┐
//!                          │  Accept   │
//!                          └───────────┘
//! ```
//!
//! `fast` mode skips the rewriter, lexical search, re-ranker and validator;
//! `direct` mode skips everything but generation.
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration and per-run pipeline tunables
//! - [`error`] - Typed pipeline error taxonomy
//! - [`models`] - Documents, chunks, requests, results and stream fragments
//! - [`chunking`] - Overlapping word-window chunking of page text
//! - [`search::bm25`] - BM25 lexical index powered by tantivy
//! - [`search::vector`] - In-memory vector store with cosine similarity and disk persistence
//! - [`search::corpus`] - Both indices behind one gate; atomic document add/delete
//! - [`search::hybrid`] - Reciprocal Rank Fusion and the hybrid retriever
//! - [`llm`] - Capability traits with Ollama / OpenAI-compatible HTTP implementations
//! - [`pipeline`] - Rewriter, re-ranker, generator, validator and the correction controller
//! - [`cache`] - TTL + LRU result cache
//! - [`metrics`] - Latency, correction and cache counters
//! - [`api`] - Axum HTTP handlers for queries, documents and metrics
//! - [`state`] - Shared application state holding the corpus, pipeline and registry

pub mod api;
pub mod cache;
pub mod chunking;
pub mod config;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod state;

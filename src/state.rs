use anyhow::Context;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::{CacheStore, MemoryCache};
use crate::chunking::chunk_document;
use crate::config::Config;
use crate::llm::chat::HttpChatClient;
use crate::llm::cross_encoder::CrossEncoderClient;
use crate::llm::embeddings::HttpEmbedder;
use crate::llm::judge::LlmJudgeScorer;
use crate::llm::{Embedder, RelevanceScorer, TextGenerator};
use crate::metrics::MetricsTracker;
use crate::models::Document;
use crate::pipeline::{Capabilities, Pipeline};
use crate::search::bm25::Bm25Index;
use crate::search::corpus::Corpus;
use crate::search::vector::VectorStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub documents: Arc<RwLock<Vec<Document>>>,
    pub corpus: Corpus,
    pub embedder: Arc<dyn Embedder>,
    pub pipeline: Arc<Pipeline>,
    pub metrics: Arc<MetricsTracker>,
    pub cache: Option<Arc<dyn CacheStore>>,
    pub query_semaphore: Arc<tokio::sync::Semaphore>,
}

impl AppState {
    /// Open the on-disk indices and build HTTP model clients from `config`.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;

        let generator: Arc<dyn TextGenerator> =
            Arc::new(HttpChatClient::new(http_client.clone(), config.llm.clone()));
        let embedder: Arc<dyn Embedder> =
            Arc::new(HttpEmbedder::new(http_client.clone(), config.llm.clone()));
        let scorer: Arc<dyn RelevanceScorer> = if config.reranker.base_url.is_some() {
            Arc::new(CrossEncoderClient::new(http_client, config.reranker.clone()))
        } else {
            tracing::info!("No reranker endpoint configured, the chat model will judge relevance");
            Arc::new(LlmJudgeScorer::new(generator.clone()))
        };

        let corpus = Corpus::new(
            Bm25Index::open_or_create(&config.index_dir())?,
            VectorStore::open_or_create(&config.vector_dir())?,
        );

        Self::with_parts(
            config,
            corpus,
            Capabilities {
                generator,
                embedder,
                scorer,
            },
        )
    }

    /// Assemble state from an existing corpus and capabilities.
    pub fn with_parts(config: Config, corpus: Corpus, capabilities: Capabilities) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let registered = load_registry(&config.db_path())?;
        let documents = reconcile(registered, &corpus.document_counts());

        let metrics = Arc::new(MetricsTracker::new());
        let cache: Option<Arc<dyn CacheStore>> = (config.cache_ttl_secs > 0).then(|| {
            Arc::new(MemoryCache::new(
                config.cache_capacity,
                Duration::from_secs(config.cache_ttl_secs),
            )) as Arc<dyn CacheStore>
        });

        let embedder = capabilities.embedder.clone();
        let mut pipeline = Pipeline::new(corpus.clone(), capabilities, config.pipeline.clone())
            .with_metrics(metrics.clone());
        if let Some(cache) = &cache {
            pipeline = pipeline.with_cache(cache.clone());
        }

        let max_queries = config.max_concurrent_queries.max(1);

        Ok(Self {
            config,
            documents: Arc::new(RwLock::new(documents)),
            corpus,
            embedder,
            pipeline: Arc::new(pipeline),
            metrics,
            cache,
            query_semaphore: Arc::new(tokio::sync::Semaphore::new(max_queries)),
        })
    }

    /// Persist the document registry to disk (atomic write via temp file + rename).
    pub fn persist_documents(&self) {
        let documents = self.documents.read();
        if let Ok(data) = serde_json::to_string_pretty(&*documents) {
            let db_path = self.config.db_path();
            let tmp_path = db_path.with_extension("json.tmp");
            if let Err(e) = std::fs::write(&tmp_path, &data).and_then(|_| std::fs::rename(&tmp_path, &db_path)) {
                tracing::warn!("Failed to persist document registry: {e}");
            }
        }
    }

    /// Chunk, embed and index a document's pages, then register it.
    pub async fn ingest(&self, filename: &str, pages: &[String]) -> anyhow::Result<Document> {
        let id = Uuid::new_v4();
        let chunks = chunk_document(
            id,
            filename,
            pages,
            self.config.chunk_size,
            self.config.chunk_overlap,
        );
        anyhow::ensure!(!chunks.is_empty(), "Document '{filename}' contains no text");

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self
            .embedder
            .embed(&texts)
            .await
            .context("Failed to embed document chunks")?;

        let chunk_count = chunks.len();
        self.corpus.add_document(chunks, embeddings).await?;

        let document = Document {
            id,
            filename: filename.to_string(),
            uploaded_at: Utc::now(),
            chunk_count,
        };
        self.documents.write().push(document.clone());
        self.persist_documents();
        self.invalidate_cache().await;

        tracing::info!(document_id = %id, filename, chunks = chunk_count, "Document indexed");
        Ok(document)
    }

    /// Remove a document from both indices and the registry.
    /// Returns false when no such document is registered.
    pub async fn remove_document(&self, id: Uuid) -> anyhow::Result<bool> {
        if !self.documents.read().iter().any(|d| d.id == id) {
            return Ok(false);
        }

        self.corpus.delete_document(id).await?;

        self.documents.write().retain(|d| d.id != id);
        self.persist_documents();
        self.invalidate_cache().await;

        tracing::info!(document_id = %id, "Document deleted");
        Ok(true)
    }

    /// Cached answers may cite passages that changed.
    async fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear().await;
        }
    }
}

/// Read the persisted registry. A corrupt file is logged and treated as empty;
/// reconciliation against the index then starts from nothing.
fn load_registry(path: &Path) -> anyhow::Result<Vec<Document>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read document registry {}", path.display()))?;
    match serde_json::from_str(&data) {
        Ok(documents) => Ok(documents),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Document registry is corrupt, starting empty");
            Ok(Vec::new())
        }
    }
}

/// Drop registry entries whose chunks never reached the index (a crash
/// between indexing and registry write) and refresh chunk counts.
fn reconcile(registered: Vec<Document>, indexed: &HashMap<Uuid, usize>) -> Vec<Document> {
    registered
        .into_iter()
        .filter_map(|mut doc| match indexed.get(&doc.id) {
            Some(&count) => {
                doc.chunk_count = count;
                Some(doc)
            }
            None => {
                tracing::warn!(document_id = %doc.id, filename = %doc.filename, "Registered document has no indexed chunks, dropping");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: Uuid, chunk_count: usize) -> Document {
        Document {
            id,
            filename: "notes.txt".into(),
            uploaded_at: Utc::now(),
            chunk_count,
        }
    }

    #[test]
    fn test_reconcile_drops_unindexed_documents() {
        let (kept, lost) = (Uuid::new_v4(), Uuid::new_v4());
        let indexed = HashMap::from([(kept, 7)]);
        let docs = reconcile(vec![doc(kept, 3), doc(lost, 2)], &indexed);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, kept);
        assert_eq!(docs[0].chunk_count, 7);
    }

    #[test]
    fn test_corrupt_registry_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_registry(&path).unwrap().is_empty());
    }

    #[test]
    fn test_registry_round_trips_and_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.json");
        assert!(load_registry(&path).unwrap().is_empty());

        let id = Uuid::new_v4();
        std::fs::write(&path, serde_json::to_string(&vec![doc(id, 2)]).unwrap()).unwrap();
        let loaded = load_registry(&path).unwrap();
        assert_eq!(loaded[0].id, id);
    }
}

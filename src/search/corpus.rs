use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use uuid::Uuid;

use crate::models::Chunk;
use crate::search::bm25::{Bm25Index, LexicalHit};
use crate::search::vector::{VectorHit, VectorStore};

/// Both indices behind one read/write gate.
///
/// Writers (document add/delete) hold the gate exclusively while touching
/// both indices, so a reader holding a [`CorpusSnapshot`] sees each document
/// either fully present or fully absent.
#[derive(Clone)]
pub struct Corpus {
    bm25: Arc<Bm25Index>,
    vectors: Arc<VectorStore>,
    gate: Arc<RwLock<()>>,
}

impl Corpus {
    pub fn new(bm25: Bm25Index, vectors: VectorStore) -> Self {
        Self {
            bm25: Arc::new(bm25),
            vectors: Arc::new(vectors),
            gate: Arc::new(RwLock::new(())),
        }
    }

    /// Throwaway corpus for tests and one-off runs.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Bm25Index::in_memory()?, VectorStore::in_memory()))
    }

    /// Index a document's chunks in both indices, or in neither.
    pub async fn add_document(&self, chunks: Vec<Chunk>, embeddings: Vec<Vec<f32>>) -> Result<()> {
        let guard = self.gate.clone().write_owned().await;
        let bm25 = self.bm25.clone();
        let vectors = self.vectors.clone();

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            vectors.add_chunks(&chunks, embeddings)?;
            if let Err(e) = bm25.index_chunks(&chunks) {
                if let Some(first) = chunks.first() {
                    if let Err(undo) = vectors.remove_document(&first.document_id) {
                        tracing::error!(error = %undo, "Failed to roll back vector entries");
                    }
                }
                return Err(e);
            }
            Ok(())
        })
        .await
        .context("Index task panicked")?
    }

    /// Remove every chunk of a document from both indices, or from neither.
    pub async fn delete_document(&self, document_id: Uuid) -> Result<()> {
        let guard = self.gate.clone().write_owned().await;
        let bm25 = self.bm25.clone();
        let vectors = self.vectors.clone();

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let removed = vectors.remove_document(&document_id)?;
            if let Err(e) = bm25.delete_document(&document_id) {
                if let Err(undo) = vectors.restore(removed) {
                    tracing::error!(error = %undo, "Failed to restore vector entries");
                }
                return Err(e);
            }
            Ok(())
        })
        .await
        .context("Delete task panicked")?
    }

    /// Wait for in-flight writes, then pin the current contents for reading.
    pub async fn snapshot(&self) -> CorpusSnapshot {
        CorpusSnapshot {
            bm25: self.bm25.clone(),
            vectors: self.vectors.clone(),
            _guard: Arc::new(self.gate.clone().read_owned().await),
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.vectors.entry_count()
    }

    pub fn num_lexical_chunks(&self) -> u64 {
        self.bm25.num_chunks()
    }

    /// Indexed chunks per document.
    pub fn document_counts(&self) -> HashMap<Uuid, usize> {
        self.vectors.document_counts()
    }
}

/// Read view of the corpus. Writers block until every clone is dropped.
#[derive(Clone)]
pub struct CorpusSnapshot {
    bm25: Arc<Bm25Index>,
    vectors: Arc<VectorStore>,
    _guard: Arc<OwnedRwLockReadGuard<()>>,
}

impl CorpusSnapshot {
    pub fn lexical(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        self.bm25.search(query, limit)
    }

    pub fn vector(&self, embedding: &[f32], limit: usize) -> Vec<VectorHit> {
        self.vectors.search(embedding, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chunks(doc: Uuid, texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                document_id: doc,
                filename: "doc.txt".into(),
                page: 0,
                chunk_index: i,
                content: t.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_add_then_delete_updates_both_indices() {
        let corpus = Corpus::in_memory().unwrap();
        let id = Uuid::new_v4();
        corpus
            .add_document(chunks(id, &["alpha beta", "gamma"]), vec![vec![1.0], vec![0.5]])
            .await
            .unwrap();
        assert_eq!(corpus.num_chunks(), 2);
        assert_eq!(corpus.num_lexical_chunks(), 2);

        corpus.delete_document(id).await.unwrap();
        assert_eq!(corpus.num_chunks(), 0);
        assert_eq!(corpus.num_lexical_chunks(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_embeddings_leave_corpus_untouched() {
        let corpus = Corpus::in_memory().unwrap();
        let id = Uuid::new_v4();
        assert!(corpus
            .add_document(chunks(id, &["alpha"]), vec![])
            .await
            .is_err());
        assert_eq!(corpus.num_chunks(), 0);
        assert_eq!(corpus.num_lexical_chunks(), 0);
    }

    #[tokio::test]
    async fn test_delete_waits_for_open_snapshot() {
        let corpus = Corpus::in_memory().unwrap();
        let id = Uuid::new_v4();
        corpus
            .add_document(chunks(id, &["alpha"]), vec![vec![1.0]])
            .await
            .unwrap();

        let snapshot = corpus.snapshot().await;
        let deleting = {
            let corpus = corpus.clone();
            tokio::spawn(async move { corpus.delete_document(id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Still visible through the snapshot in both indices
        assert_eq!(snapshot.vector(&[1.0], 5).len(), 1);
        assert_eq!(snapshot.lexical("alpha", 5).unwrap().len(), 1);
        assert!(!deleting.is_finished());

        drop(snapshot);
        deleting.await.unwrap().unwrap();
        let after = corpus.snapshot().await;
        assert!(after.vector(&[1.0], 5).is_empty());
        assert!(after.lexical("alpha", 5).unwrap().is_empty());
    }
}

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::Chunk;

/// A stored vector entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    chunk: Chunk,
    embedding: Vec<f32>,
}

/// In-memory vector store with optional disk persistence and cosine similarity search.
pub struct VectorStore {
    entries: RwLock<Vec<VectorEntry>>,
    persist_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk: Chunk,
    pub score: f32,
}

impl VectorStore {
    pub fn open_or_create(vector_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(vector_dir)?;
        let persist_path = vector_dir.join("vectors.json");

        let entries = if persist_path.exists() {
            let data =
                std::fs::read_to_string(&persist_path).context("Failed to read vector store")?;
            serde_json::from_str(&data).context("Failed to parse vector store")?
        } else {
            Vec::new()
        };

        Ok(Self {
            entries: RwLock::new(entries),
            persist_path: Some(persist_path),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            persist_path: None,
        }
    }

    fn persist(&self, entries: &[VectorEntry]) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        // Atomic write via temp file + rename
        let data = serde_json::to_string(entries)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, data).context("Failed to write vector store")?;
        std::fs::rename(&tmp_path, path).context("Failed to replace vector store")?;
        Ok(())
    }

    /// Add vectors for chunks. `embeddings` must be parallel with `chunks`.
    /// Nothing is added unless every chunk has an embedding and the store persists.
    pub fn add_chunks(&self, chunks: &[Chunk], embeddings: Vec<Vec<f32>>) -> Result<()> {
        anyhow::ensure!(
            chunks.len() == embeddings.len(),
            "Got {} embeddings for {} chunks",
            embeddings.len(),
            chunks.len()
        );

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.extend(
            chunks
                .iter()
                .cloned()
                .zip(embeddings)
                .map(|(chunk, embedding)| VectorEntry { chunk, embedding }),
        );

        if let Err(e) = self.persist(&entries) {
            entries.truncate(before);
            return Err(e);
        }
        Ok(())
    }

    /// Remove all vectors of a document and return them so the caller can
    /// restore them if a paired operation fails.
    pub fn remove_document(&self, document_id: &Uuid) -> Result<Vec<VectorEntry>> {
        let mut entries = self.entries.write();
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *entries)
            .into_iter()
            .partition(|e| &e.chunk.document_id == document_id);
        *entries = kept;

        if let Err(e) = self.persist(&entries) {
            entries.extend(removed);
            return Err(e);
        }
        Ok(removed)
    }

    /// Put back entries previously returned by [`VectorStore::remove_document`].
    pub fn restore(&self, removed: Vec<VectorEntry>) -> Result<()> {
        let mut entries = self.entries.write();
        entries.extend(removed);
        self.persist(&entries)
    }

    /// Search by cosine similarity against a query embedding, highest first.
    pub fn search(&self, query_embedding: &[f32], limit: usize) -> Vec<VectorHit> {
        let entries = self.entries.read();

        let mut scored: Vec<(f32, &VectorEntry)> = entries
            .iter()
            .map(|e| (cosine_similarity(query_embedding, &e.embedding), e))
            .collect();

        // Sort descending by score; chunk key keeps equal scores deterministic
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.chunk.key().cmp(&b.1.chunk.key()))
        });
        scored.truncate(limit);

        scored
            .into_iter()
            .map(|(score, e)| VectorHit {
                chunk: e.chunk.clone(),
                score,
            })
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn document_counts(&self) -> HashMap<Uuid, usize> {
        self.entries
            .read()
            .iter()
            .fold(HashMap::new(), |mut counts, e| {
                *counts.entry(e.chunk.document_id).or_insert(0) += 1;
                counts
            })
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });
    let denom = aa.sqrt() * bb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: Uuid, idx: usize) -> Chunk {
        Chunk {
            document_id: doc,
            filename: "f.pdf".into(),
            page: 0,
            chunk_index: idx,
            content: format!("chunk {idx}"),
        }
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_or_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let store = VectorStore::in_memory();
        let id = Uuid::new_v4();
        store
            .add_chunks(
                &[chunk(id, 0), chunk(id, 1)],
                vec![vec![0.0, 1.0], vec![1.0, 0.1]],
            )
            .unwrap();
        let hits = store.search(&[1.0, 0.0], 10);
        assert_eq!(hits[0].chunk.chunk_index, 1);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_add_rejects_mismatched_embeddings() {
        let store = VectorStore::in_memory();
        let id = Uuid::new_v4();
        assert!(store.add_chunks(&[chunk(id, 0)], vec![]).is_err());
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn test_remove_and_restore_document() {
        let store = VectorStore::in_memory();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .add_chunks(
                &[chunk(a, 0), chunk(a, 1), chunk(b, 0)],
                vec![vec![1.0], vec![1.0], vec![1.0]],
            )
            .unwrap();

        let removed = store.remove_document(&a).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.entry_count(), 1);
        assert_eq!(store.document_counts().get(&a), None);

        store.restore(removed).unwrap();
        assert_eq!(store.document_counts()[&a], 2);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let store = VectorStore::open_or_create(dir.path()).unwrap();
            store.add_chunks(&[chunk(id, 0)], vec![vec![0.5, 0.5]]).unwrap();
        }
        let store = VectorStore::open_or_create(dir.path()).unwrap();
        assert_eq!(store.entry_count(), 1);
        assert_eq!(store.search(&[0.5, 0.5], 1)[0].chunk.document_id, id);
    }
}

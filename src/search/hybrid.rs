use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::llm::Embedder;
use crate::models::{Chunk, ChunkKey};
use crate::search::bm25::LexicalHit;
use crate::search::corpus::{Corpus, CorpusSnapshot};
use crate::search::vector::VectorHit;

/// Lexical + vector results for a single query variant.
#[derive(Debug, Clone, Default)]
pub struct QueryResults {
    pub lexical_hits: Vec<LexicalHit>,
    pub vector_hits: Vec<VectorHit>,
}

impl QueryResults {
    fn lists(&self) -> [Vec<&Chunk>; 2] {
        [
            self.lexical_hits.iter().map(|h| &h.chunk).collect(),
            self.vector_hits.iter().map(|h| &h.chunk).collect(),
        ]
    }
}

/// One fused retrieval candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: Chunk,
    /// Fused RRF score. Only meaningful for ordering within one fusion.
    pub score: f32,
    /// Number of ranked lists the chunk appeared in
    pub list_count: usize,
}

/// Reciprocal Rank Fusion over every ranked list of every query variant.
///
/// `score(chunk) = Σ 1 / (rank_constant + rank)` with 1-based ranks, summed
/// over the lists the chunk appears in. Ties go to the chunk found by more
/// lists, then to the smaller (document id, page, chunk index) key, so the
/// output is fully deterministic.
pub fn rrf_fusion(query_results: &[QueryResults], rank_constant: f32, limit: usize) -> Vec<Candidate> {
    struct Acc {
        candidate: Candidate,
        score: f64,
    }

    let k = rank_constant as f64;
    let mut score_map: HashMap<ChunkKey, Acc> = HashMap::new();

    for qr in query_results {
        for list in qr.lists() {
            let mut seen: HashSet<ChunkKey> = HashSet::new();
            for (rank, chunk) in list.iter().enumerate() {
                let key = chunk.key();
                // A chunk counts once per list, at its best rank
                if !seen.insert(key) {
                    continue;
                }
                let entry = score_map.entry(key).or_insert_with(|| Acc {
                    candidate: Candidate {
                        chunk: (*chunk).clone(),
                        score: 0.0,
                        list_count: 0,
                    },
                    score: 0.0,
                });
                entry.score += 1.0 / (k + rank as f64 + 1.0);
                entry.candidate.list_count += 1;
            }
        }
    }

    let mut results: Vec<Acc> = score_map.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.candidate.list_count.cmp(&a.candidate.list_count))
            .then_with(|| a.candidate.chunk.key().cmp(&b.candidate.chunk.key()))
    });
    results.truncate(limit);
    results
        .into_iter()
        .map(|acc| Candidate {
            score: acc.score as f32,
            ..acc.candidate
        })
        .collect()
}

/// Output of one retrieval pass.
#[derive(Debug, Default)]
pub struct Retrieval {
    pub candidates: Vec<Candidate>,
    pub lexical_hits: usize,
    pub vector_hits: usize,
    /// Sources that failed and were left out of the fusion
    pub failures: Vec<PipelineError>,
}

/// Hybrid retriever: every variant is searched lexically and by vector, all
/// variants concurrently; every resulting list is fused with RRF.
#[derive(Clone)]
pub struct HybridRetriever {
    corpus: Corpus,
    embedder: Arc<dyn Embedder>,
}

impl HybridRetriever {
    pub fn new(corpus: Corpus, embedder: Arc<dyn Embedder>) -> Self {
        Self { corpus, embedder }
    }

    /// Retrieve and fuse candidates for every variant.
    ///
    /// Query embeddings are computed before the corpus snapshot is taken, so
    /// a slow embedding call never holds back a pending document write.
    /// A failing source (embedding call, lexical query) is reported in
    /// [`Retrieval::failures`] and excluded; the rest still fuse. With
    /// `vector_only` the lexical index is not consulted.
    pub async fn retrieve(
        &self,
        variants: &[String],
        config: &PipelineConfig,
        vector_only: bool,
    ) -> Retrieval {
        let embeddings = futures_util::future::join_all(
            variants.iter().map(|variant| self.embed_variant(variant, config)),
        )
        .await;

        let snapshot = self.corpus.snapshot().await;
        let per_variant = variants.iter().zip(embeddings).map(|(variant, embedding)| {
            search_variant(&snapshot, variant, embedding, config, vector_only)
        });
        let outcomes = futures_util::future::join_all(per_variant).await;
        drop(snapshot);

        let mut retrieval = Retrieval::default();
        let mut query_results = Vec::with_capacity(outcomes.len());
        for (results, failures) in outcomes {
            retrieval.lexical_hits += results.lexical_hits.len();
            retrieval.vector_hits += results.vector_hits.len();
            retrieval.failures.extend(failures);
            query_results.push(results);
        }

        retrieval.candidates = rrf_fusion(&query_results, config.rank_constant, config.fused_limit);
        for failure in &retrieval.failures {
            tracing::warn!(error = %failure, "Retrieval source excluded");
        }
        tracing::info!(
            variants = variants.len(),
            lexical_hits = retrieval.lexical_hits,
            vector_hits = retrieval.vector_hits,
            fused = retrieval.candidates.len(),
            "retrieve"
        );
        retrieval
    }

    /// `Ok(None)` when vector search is disabled for this pass.
    async fn embed_variant(
        &self,
        variant: &str,
        config: &PipelineConfig,
    ) -> std::result::Result<Option<Vec<f32>>, String> {
        if config.top_k_vector == 0 {
            return Ok(None);
        }
        self.embedder
            .embed_one(variant)
            .await
            .map(Some)
            .map_err(|e| format!("embedding: {e:#}"))
    }
}

async fn search_variant(
    snapshot: &CorpusSnapshot,
    variant: &str,
    embedding: std::result::Result<Option<Vec<f32>>, String>,
    config: &PipelineConfig,
    vector_only: bool,
) -> (QueryResults, Vec<PipelineError>) {
    let failure = |reason: String| PipelineError::RetrievalPartialFailure {
        variant: variant.to_string(),
        reason,
    };
    let mut results = QueryResults::default();
    let mut failures = Vec::new();

    if !vector_only && config.top_k_lexical > 0 {
        let snapshot = snapshot.clone();
        let query = variant.to_string();
        let limit = config.top_k_lexical;
        match tokio::task::spawn_blocking(move || snapshot.lexical(&query, limit)).await {
            Ok(Ok(hits)) => results.lexical_hits = hits,
            Ok(Err(e)) => failures.push(failure(format!("lexical search: {e:#}"))),
            Err(e) => failures.push(failure(format!("lexical search task: {e}"))),
        }
    }

    match embedding {
        Ok(Some(embedding)) => {
            results.vector_hits = snapshot.vector(&embedding, config.top_k_vector);
        }
        Ok(None) => {}
        Err(reason) => failures.push(failure(reason)),
    }
    (results, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn chunk(doc: Uuid, idx: usize) -> Chunk {
        Chunk {
            document_id: doc,
            filename: "doc.pdf".to_string(),
            page: 0,
            chunk_index: idx,
            content: format!("chunk {idx}"),
        }
    }

    fn lexical(chunks: &[Chunk]) -> Vec<LexicalHit> {
        chunks
            .iter()
            .enumerate()
            .map(|(i, c)| LexicalHit {
                chunk: c.clone(),
                score: 10.0 - i as f32,
            })
            .collect()
    }

    fn vector(chunks: &[Chunk]) -> Vec<VectorHit> {
        chunks
            .iter()
            .enumerate()
            .map(|(i, c)| VectorHit {
                chunk: c.clone(),
                score: 0.9 - i as f32 * 0.1,
            })
            .collect()
    }

    #[test]
    fn test_empty_inputs() {
        assert!(rrf_fusion(&[], 60.0, 10).is_empty());
        assert!(rrf_fusion(&[QueryResults::default()], 60.0, 10).is_empty());
    }

    #[test]
    fn test_exact_rrf_formula() {
        let id = Uuid::new_v4();
        let (a, b) = (chunk(id, 0), chunk(id, 1));
        // a: rank 1 lexical + rank 2 vector; b: rank 2 lexical + rank 1 vector
        let qr = QueryResults {
            lexical_hits: lexical(&[a.clone(), b.clone()]),
            vector_hits: vector(&[b.clone(), a.clone()]),
        };
        let results = rrf_fusion(&[qr], 60.0, 10);
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        for r in &results {
            assert!((r.score as f64 - expected).abs() < 1e-6);
            assert_eq!(r.list_count, 2);
        }
    }

    #[test]
    fn test_sums_across_variants() {
        let id = Uuid::new_v4();
        let a = chunk(id, 0);
        let qr = QueryResults {
            lexical_hits: lexical(&[a.clone()]),
            vector_hits: vec![],
        };
        let results = rrf_fusion(&[qr.clone(), qr.clone(), qr], 60.0, 10);
        assert_eq!(results.len(), 1);
        assert!((results[0].score as f64 - 3.0 / 61.0).abs() < 1e-6);
        assert_eq!(results[0].list_count, 3);
    }

    #[test]
    fn test_vector_only_keeps_vector_order() {
        let id = Uuid::new_v4();
        let chunks: Vec<Chunk> = (0..4).map(|i| chunk(id, i)).collect();
        let reversed: Vec<Chunk> = chunks.iter().rev().cloned().collect();
        let qr = QueryResults {
            lexical_hits: vec![],
            vector_hits: vector(&reversed),
        };
        let results = rrf_fusion(&[qr], 60.0, 10);
        let order: Vec<usize> = results.iter().map(|r| r.chunk.chunk_index).collect();
        assert_eq!(order, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_tie_broken_by_list_count_then_key() {
        let (lo, hi) = (Uuid::from_u128(1), Uuid::from_u128(2));
        // Each chunk appears once at rank 1 in a different variant: equal scores
        let first = QueryResults {
            lexical_hits: lexical(&[chunk(hi, 0)]),
            vector_hits: vec![],
        };
        let second = QueryResults {
            lexical_hits: vec![],
            vector_hits: vector(&[chunk(lo, 0)]),
        };
        let results = rrf_fusion(&[first, second], 60.0, 10);
        assert_eq!(results[0].chunk.document_id, lo);
        assert_eq!(results[1].chunk.document_id, hi);
    }

    #[test]
    fn test_duplicate_within_list_counted_once() {
        let id = Uuid::new_v4();
        let a = chunk(id, 0);
        let qr = QueryResults {
            lexical_hits: lexical(&[a.clone(), a.clone()]),
            vector_hits: vec![],
        };
        let results = rrf_fusion(&[qr], 60.0, 10);
        assert_eq!(results[0].list_count, 1);
        assert!((results[0].score as f64 - 1.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn test_limit_truncates() {
        let id = Uuid::new_v4();
        let chunks: Vec<Chunk> = (0..10).map(|i| chunk(id, i)).collect();
        let qr = QueryResults {
            lexical_hits: lexical(&chunks),
            vector_hits: vec![],
        };
        assert_eq!(rrf_fusion(&[qr], 60.0, 3).len(), 3);
    }
}

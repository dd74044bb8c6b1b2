use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::llm::RelevanceScorer;
use crate::models::Chunk;
use crate::search::hybrid::Candidate;

/// A passage chosen for generation, with its relevance score.
#[derive(Debug, Clone)]
pub struct RankedPassage {
    pub chunk: Chunk,
    pub score: f32,
}

/// Re-scores fused candidates against the original question.
pub struct Reranker {
    scorer: Arc<dyn RelevanceScorer>,
}

impl Reranker {
    pub fn new(scorer: Arc<dyn RelevanceScorer>) -> Self {
        Self { scorer }
    }

    /// Score every candidate and keep the best `top_n`, highest first.
    /// Equal scores keep their fused order.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[Candidate],
        top_n: usize,
    ) -> Result<Vec<RankedPassage>> {
        if candidates.is_empty() || top_n == 0 {
            return Ok(Vec::new());
        }

        let passages: Vec<String> = candidates.iter().map(|c| c.chunk.content.clone()).collect();
        let scores = self
            .scorer
            .score(query, &passages)
            .await
            .map_err(|e| PipelineError::RerankUnavailable(format!("{e:#}")))?;

        if scores.len() != candidates.len() {
            return Err(PipelineError::RerankUnavailable(format!(
                "scorer returned {} scores for {} passages",
                scores.len(),
                candidates.len()
            )));
        }

        let mut ranked: Vec<RankedPassage> = candidates
            .iter()
            .zip(scores)
            .map(|(c, score)| RankedPassage {
                chunk: c.chunk.clone(),
                score: if score.is_nan() { f32::NEG_INFINITY } else { score },
            })
            .collect();

        // sort_by is stable
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(top_n);

        tracing::info!(
            candidates = candidates.len(),
            kept = ranked.len(),
            top_score = ranked.first().map(|p| p.score),
            "rerank"
        );
        Ok(ranked)
    }
}

/// Fallback when re-ranking is skipped or unavailable: the first `top_n`
/// candidates in fused order.
pub fn fused_order(candidates: &[Candidate], top_n: usize) -> Vec<RankedPassage> {
    candidates
        .iter()
        .take(top_n)
        .map(|c| RankedPassage {
            chunk: c.chunk.clone(),
            score: c.score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use uuid::Uuid;

    /// Scores a passage by how many times it contains the query.
    struct CountMatches;

    #[async_trait]
    impl RelevanceScorer for CountMatches {
        async fn score(&self, query: &str, passages: &[String]) -> anyhow::Result<Vec<f32>> {
            Ok(passages.iter().map(|p| p.matches(query).count() as f32).collect())
        }
    }

    struct Down;

    #[async_trait]
    impl RelevanceScorer for Down {
        async fn score(&self, _query: &str, _passages: &[String]) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("connection refused")
        }
    }

    struct Short;

    #[async_trait]
    impl RelevanceScorer for Short {
        async fn score(&self, _query: &str, _passages: &[String]) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0])
        }
    }

    fn candidates(texts: &[&str]) -> Vec<Candidate> {
        let id = Uuid::new_v4();
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Candidate {
                chunk: Chunk {
                    document_id: id,
                    filename: "f.txt".into(),
                    page: 0,
                    chunk_index: i,
                    content: t.to_string(),
                },
                score: 1.0 / (i + 1) as f32,
                list_count: 1,
            })
            .collect()
    }

    fn indices(passages: &[RankedPassage]) -> Vec<usize> {
        passages.iter().map(|p| p.chunk.chunk_index).collect()
    }

    #[tokio::test]
    async fn test_orders_by_score_and_truncates() {
        let reranker = Reranker::new(Arc::new(CountMatches));
        let c = candidates(&["x", "x x x", "none", "x x"]);
        let ranked = reranker.rerank("x", &c, 2).await.unwrap();
        assert_eq!(indices(&ranked), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_ties_keep_fused_order() {
        let reranker = Reranker::new(Arc::new(CountMatches));
        let c = candidates(&["a", "b", "c"]);
        let ranked = reranker.rerank("zzz", &c, 3).await.unwrap();
        assert_eq!(indices(&ranked), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_rerank_is_idempotent() {
        let reranker = Reranker::new(Arc::new(CountMatches));
        let c = candidates(&["x x", "x", "x x x"]);
        let first = reranker.rerank("x", &c, 3).await.unwrap();
        let again: Vec<Candidate> = first
            .iter()
            .map(|p| Candidate {
                chunk: p.chunk.clone(),
                score: p.score,
                list_count: 1,
            })
            .collect();
        let second = reranker.rerank("x", &again, 3).await.unwrap();
        assert_eq!(indices(&first), indices(&second));
    }

    #[tokio::test]
    async fn test_scorer_failure_is_unavailable() {
        let reranker = Reranker::new(Arc::new(Down));
        let err = reranker.rerank("q", &candidates(&["a"]), 5).await.unwrap_err();
        assert!(matches!(err, PipelineError::RerankUnavailable(_)));
    }

    #[tokio::test]
    async fn test_score_count_mismatch_is_unavailable() {
        let reranker = Reranker::new(Arc::new(Short));
        let err = reranker
            .rerank("q", &candidates(&["a", "b"]), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RerankUnavailable(_)));
    }

    #[test]
    fn test_fused_order_fallback() {
        let c = candidates(&["a", "b", "c"]);
        assert_eq!(indices(&fused_order(&c, 2)), vec![0, 1]);
    }
}

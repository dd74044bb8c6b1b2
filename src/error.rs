use thiserror::Error;

/// Failures a pipeline stage can report.
///
/// Only [`PipelineError::GenerationFailure`], [`PipelineError::InvalidQuery`]
/// and [`PipelineError::Internal`] ever reach a caller. The other variants are
/// logged and degraded locally by the controller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("query rewrite degraded to the original query: {0}")]
    RewriteDegraded(String),

    #[error("retrieval partially failed for '{variant}': {reason}")]
    RetrievalPartialFailure { variant: String, reason: String },

    #[error("reranker unavailable: {0}")]
    RerankUnavailable(String),

    #[error("answer generation failed: {0}")]
    GenerationFailure(String),

    #[error("validation inconclusive: {0}")]
    ValidationInconclusive(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the controller may continue after this error.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::RewriteDegraded(_)
                | Self::RetrievalPartialFailure { .. }
                | Self::RerankUnavailable(_)
                | Self::ValidationInconclusive(_)
        )
    }

    pub fn generation(err: anyhow::Error) -> Self {
        Self::GenerationFailure(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degradable_variants() {
        assert!(PipelineError::RewriteDegraded("x".into()).is_degradable());
        assert!(PipelineError::RerankUnavailable("x".into()).is_degradable());
        assert!(PipelineError::ValidationInconclusive("x".into()).is_degradable());
        assert!(PipelineError::RetrievalPartialFailure {
            variant: "q".into(),
            reason: "down".into()
        }
        .is_degradable());
    }

    #[test]
    fn test_fatal_variants() {
        assert!(!PipelineError::GenerationFailure("x".into()).is_degradable());
        assert!(!PipelineError::InvalidQuery("x".into()).is_degradable());
        assert!(!PipelineError::Internal("x".into()).is_degradable());
    }

    #[test]
    fn test_generation_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("Failed to call Ollama");
        let msg = PipelineError::generation(err).to_string();
        assert!(msg.contains("Failed to call Ollama"));
        assert!(msg.contains("connection refused"));
    }
}

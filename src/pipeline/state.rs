use std::time::Instant;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::models::{QueryMode, SourceRef};

/// Position of a run in the correction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Rewrite,
    Retrieve,
    Rerank,
    Generate,
    Validate,
    Accept,
    Retry,
}

impl Stage {
    /// Legal transitions. Fast mode skips Rerank and Validate; Accept is terminal.
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Rewrite, Retrieve)
                | (Retrieve, Rerank)
                | (Retrieve, Generate)
                | (Rerank, Generate)
                | (Generate, Validate)
                | (Generate, Accept)
                | (Validate, Accept)
                | (Validate, Retry)
                | (Retry, Rewrite)
        )
    }
}

/// What one generation attempt produced.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub variants: usize,
    pub retrieved: usize,
    pub ranked: usize,
    pub top_score: Option<f32>,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub supported: Option<bool>,
    pub rationale: Option<String>,
}

/// Per-query record of the correction loop. Owned by one run, never shared.
#[derive(Debug)]
pub struct RunState {
    pub query: String,
    pub mode: QueryMode,
    pub config: PipelineConfig,
    stage: Stage,
    retries: u32,
    pub attempts: Vec<Attempt>,
    pub rewrite_degraded: bool,
    pub rerank_degraded: bool,
    pub started: Instant,
}

impl RunState {
    pub fn new(query: String, mode: QueryMode, config: PipelineConfig) -> Self {
        let stage = match mode {
            QueryMode::Agentic => Stage::Rewrite,
            QueryMode::Fast => Stage::Retrieve,
            QueryMode::Direct => Stage::Generate,
        };
        Self {
            query,
            mode,
            config,
            stage,
            retries: 0,
            attempts: Vec::new(),
            rewrite_degraded: false,
            rerank_degraded: false,
            started: Instant::now(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Move to `next`, rejecting transitions the loop does not allow.
    pub fn advance(&mut self, next: Stage) -> Result<()> {
        if !self.stage.can_advance_to(next) {
            return Err(PipelineError::Internal(format!(
                "illegal stage transition {:?} -> {:?}",
                self.stage, next
            )));
        }
        tracing::debug!(from = ?self.stage, to = ?next, "stage");
        self.stage = next;
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.retries < self.config.max_retries
    }

    /// Enter [`Stage::Retry`] and bump the counter. Fails once retries are spent.
    pub fn retry(&mut self) -> Result<()> {
        if !self.can_retry() {
            return Err(PipelineError::Internal(format!(
                "retry budget of {} exhausted",
                self.config.max_retries
            )));
        }
        self.advance(Stage::Retry)?;
        self.retries += 1;
        Ok(())
    }

    /// Retrieval widths for the current attempt.
    pub fn effective_config(&self) -> PipelineConfig {
        self.config.widened(self.retries)
    }

    /// The last answer that failed validation, fed back to the rewriter.
    pub fn rejected_answer(&self) -> Option<&str> {
        self.attempts
            .last()
            .filter(|a| a.supported == Some(false))
            .map(|a| a.answer.as_str())
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max_retries: u32) -> RunState {
        RunState::new(
            "q".into(),
            QueryMode::Agentic,
            PipelineConfig {
                max_retries,
                ..PipelineConfig::default()
            },
        )
    }

    fn attempt(supported: Option<bool>) -> Attempt {
        Attempt {
            variants: 1,
            retrieved: 0,
            ranked: 0,
            top_score: None,
            answer: "old answer".into(),
            sources: vec![],
            supported,
            rationale: None,
        }
    }

    #[test]
    fn test_initial_stage_depends_on_mode() {
        let cfg = PipelineConfig::default;
        assert_eq!(RunState::new("q".into(), QueryMode::Agentic, cfg()).stage(), Stage::Rewrite);
        assert_eq!(RunState::new("q".into(), QueryMode::Fast, cfg()).stage(), Stage::Retrieve);
        assert_eq!(RunState::new("q".into(), QueryMode::Direct, cfg()).stage(), Stage::Generate);
    }

    #[test]
    fn test_full_loop_transitions() {
        let mut s = state(1);
        for next in [Stage::Retrieve, Stage::Rerank, Stage::Generate, Stage::Validate] {
            s.advance(next).unwrap();
        }
        s.retry().unwrap();
        assert_eq!(s.retries(), 1);
        s.advance(Stage::Rewrite).unwrap();
    }

    #[test]
    fn test_illegal_transition_is_internal_error() {
        let mut s = state(1);
        let err = s.advance(Stage::Validate).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
        assert_eq!(s.stage(), Stage::Rewrite);
        assert!(!Stage::Accept.can_advance_to(Stage::Rewrite));
    }

    #[test]
    fn test_retry_bounded() {
        let mut s = state(1);
        for next in [Stage::Retrieve, Stage::Rerank, Stage::Generate, Stage::Validate] {
            s.advance(next).unwrap();
        }
        s.retry().unwrap();
        assert!(!s.can_retry());
        for next in [Stage::Rewrite, Stage::Retrieve, Stage::Rerank, Stage::Generate, Stage::Validate] {
            s.advance(next).unwrap();
        }
        assert!(s.retry().is_err());
        assert_eq!(s.retries(), 1);
    }

    #[test]
    fn test_zero_retries_never_retries() {
        assert!(!state(0).can_retry());
    }

    #[test]
    fn test_effective_config_widens_per_retry() {
        let mut s = state(2);
        let base = s.effective_config().top_k_vector;
        for next in [Stage::Retrieve, Stage::Generate, Stage::Validate] {
            s.advance(next).unwrap();
        }
        s.retry().unwrap();
        assert_eq!(s.effective_config().top_k_vector, base + s.config.widen_step);
    }

    #[test]
    fn test_rejected_answer_only_after_failed_validation() {
        let mut s = state(2);
        assert_eq!(s.rejected_answer(), None);
        s.attempts.push(attempt(Some(true)));
        assert_eq!(s.rejected_answer(), None);
        s.attempts.push(attempt(Some(false)));
        assert_eq!(s.rejected_answer(), Some("old answer"));
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::cache::{cache_key, CacheStore};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::llm::{Embedder, RelevanceScorer, TextGenerator};
use crate::metrics::{MetricsTracker, QueryOutcome};
use crate::models::{Fragment, QueryMode, QueryRequest, QueryResult, ResultMetadata, StreamMetadata};
use crate::pipeline::generator::{Answer, AnswerGenerator, AnswerRequest, Streamed};
use crate::pipeline::reranker::{fused_order, RankedPassage, Reranker};
use crate::pipeline::rewriter::QueryRewriter;
use crate::pipeline::state::{Attempt, RunState, Stage};
use crate::pipeline::validator::{AnswerValidator, Verdict};
use crate::search::corpus::Corpus;
use crate::search::hybrid::HybridRetriever;

/// Fragments buffered between the pipeline task and a slow consumer.
const STREAM_BUFFER: usize = 64;

/// The model-backed capabilities a pipeline is built from.
#[derive(Clone)]
pub struct Capabilities {
    pub generator: Arc<dyn TextGenerator>,
    pub embedder: Arc<dyn Embedder>,
    pub scorer: Arc<dyn RelevanceScorer>,
}

/// The correction controller: runs queries through rewrite, retrieval,
/// re-ranking, generation and validation, retrying with wider retrieval
/// while the answer is unsupported and retries remain.
pub struct Pipeline {
    rewriter: QueryRewriter,
    retriever: HybridRetriever,
    reranker: Reranker,
    generator: AnswerGenerator,
    validator: AnswerValidator,
    cache: Option<Arc<dyn CacheStore>>,
    metrics: Arc<MetricsTracker>,
    config: PipelineConfig,
}

/// How answer text reaches the caller.
enum Delivery<'a> {
    Atomic,
    Incremental {
        tx: &'a mpsc::Sender<Fragment>,
        cancel: &'a CancellationToken,
    },
}

impl Delivery<'_> {
    /// Await `fut` unless the run is cancelled first.
    async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        match self {
            Delivery::Atomic => Some(fut.await),
            Delivery::Incremental { cancel, .. } => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                out = fut => Some(out),
            },
        }
    }

    /// False when the consumer is gone.
    async fn send(&self, fragment: Fragment) -> bool {
        match self {
            Delivery::Atomic => true,
            Delivery::Incremental { tx, cancel } => tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = tx.send(fragment) => sent.is_ok(),
            },
        }
    }
}

enum Flow {
    Done(QueryResult),
    Cancelled,
}

impl Pipeline {
    pub fn new(corpus: Corpus, capabilities: Capabilities, config: PipelineConfig) -> Self {
        let Capabilities {
            generator,
            embedder,
            scorer,
        } = capabilities;
        Self {
            rewriter: QueryRewriter::new(generator.clone()),
            retriever: HybridRetriever::new(corpus, embedder),
            reranker: Reranker::new(scorer),
            generator: AnswerGenerator::new(generator.clone()),
            validator: AnswerValidator::new(generator),
            cache: None,
            metrics: Arc::new(MetricsTracker::new()),
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsTracker>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.generator = self.generator.with_idle_timeout(idle_timeout);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    /// Run a query to completion and return the whole result.
    pub async fn answer(&self, req: QueryRequest) -> Result<QueryResult> {
        match self.execute(req, &Delivery::Atomic).await? {
            Flow::Done(result) => Ok(result),
            Flow::Cancelled => Err(PipelineError::Internal(
                "atomic run reported cancellation".to_string(),
            )),
        }
    }

    /// Run a query in the background and stream its fragments.
    ///
    /// The stream yields answer chunks, a correction marker before each retry,
    /// and finally one metadata fragment, or a single error fragment. Dropping
    /// the stream or cancelling `cancel` stops the run at its next await point.
    pub fn answer_stream(
        self: Arc<Self>,
        req: QueryRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<Fragment> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let delivery = Delivery::Incremental {
                tx: &tx,
                cancel: &cancel,
            };
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tx.closed() => {
                    cancel.cancel();
                    return;
                }
                outcome = self.execute(req, &delivery) => outcome,
            };

            let last = match outcome {
                Ok(Flow::Done(result)) => Fragment::Metadata(StreamMetadata::from(&result)),
                Ok(Flow::Cancelled) => {
                    tracing::info!("Query stream cancelled");
                    return;
                }
                Err(e) => Fragment::Error {
                    message: e.to_string(),
                },
            };
            let _ = tx.send(last).await;
        });

        ReceiverStream::new(rx)
    }

    async fn execute(&self, req: QueryRequest, delivery: &Delivery<'_>) -> Result<Flow> {
        let started = Instant::now();
        let mode = req.mode;
        let outcome = self.run(req, delivery).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match &outcome {
            Ok(Flow::Done(result)) => {
                tracing::info!(
                    mode = mode.as_str(),
                    attempts = result.attempts,
                    validated = result.validated,
                    cache_hit = result.cache_hit,
                    latency_ms,
                    "Query answered"
                );
                self.metrics.record(QueryOutcome::Answered {
                    latency_ms,
                    was_corrected: result.was_corrected,
                    validated: result.validated,
                    cache_hit: result.cache_hit,
                });
            }
            Ok(Flow::Cancelled) => {}
            Err(e) => {
                tracing::error!(mode = mode.as_str(), error = %e, "Query failed");
                self.metrics.record(QueryOutcome::Failed { latency_ms });
            }
        }
        outcome
    }

    async fn run(&self, req: QueryRequest, delivery: &Delivery<'_>) -> Result<Flow> {
        if req.query.trim().is_empty() {
            return Err(PipelineError::InvalidQuery("query is empty".to_string()));
        }
        let config = match &req.pipeline {
            Some(requested) => requested.bounded_by(&self.config),
            None => self.config.clone(),
        };
        let cache = self.cache.as_ref().filter(|_| req.use_cache);
        let key = cache_key(&req.query, req.mode, req.max_sentences, &config);
        let epoch = cache.map(|c| c.epoch());

        if let Some(cache) = cache {
            if let Some(mut hit) = cache.get(&key).await {
                hit.cache_hit = true;
                hit.response_time_ms = 0.0;
                let chunk = Fragment::AnswerChunk {
                    content: hit.answer.clone(),
                    attempt: hit.attempts,
                };
                if !delivery.send(chunk).await {
                    return Ok(Flow::Cancelled);
                }
                return Ok(Flow::Done(hit));
            }
        }

        let mut state = RunState::new(req.query.trim().to_string(), req.mode, config);
        let flow = match req.mode {
            QueryMode::Agentic => self.run_agentic(&mut state, req.max_sentences, delivery).await?,
            QueryMode::Fast => self.run_fast(&mut state, req.max_sentences, delivery).await?,
            QueryMode::Direct => self.run_direct(&mut state, req.max_sentences, delivery).await?,
        };

        if let (Flow::Done(result), Some(cache), Some(epoch)) = (&flow, cache, epoch) {
            // An answer that never passed validation is not worth replaying
            if (result.validated || result.mode != QueryMode::Agentic)
                && !cache.set(&key, result.clone(), epoch).await
            {
                tracing::debug!("Corpus changed during the run, answer not cached");
            }
        }
        Ok(flow)
    }

    async fn run_agentic(
        &self,
        state: &mut RunState,
        max_sentences: Option<usize>,
        delivery: &Delivery<'_>,
    ) -> Result<Flow> {
        loop {
            let attempt = state.retries() + 1;
            let config = state.effective_config();

            let rewrite = self.rewriter.rewrite(
                &state.query,
                config.num_query_variations,
                state.rejected_answer(),
            );
            let Some(rewrite) = delivery.run(rewrite).await else {
                return Ok(Flow::Cancelled);
            };
            let variants = match rewrite {
                Ok(variants) => variants,
                Err(e) if e.is_degradable() => {
                    tracing::warn!(error = %e, "Searching with the original query only");
                    state.rewrite_degraded = true;
                    vec![state.query.clone()]
                }
                Err(e) => return Err(e),
            };

            state.advance(Stage::Retrieve)?;
            let Some(retrieval) = delivery
                .run(self.retriever.retrieve(&variants, &config, false))
                .await
            else {
                return Ok(Flow::Cancelled);
            };

            state.advance(Stage::Rerank)?;
            let rerank = self
                .reranker
                .rerank(&state.query, &retrieval.candidates, config.top_k_rerank);
            let Some(rerank) = delivery.run(rerank).await else {
                return Ok(Flow::Cancelled);
            };
            let (passages, top_score) = match rerank {
                Ok(passages) => {
                    let top = passages.first().map(|p| p.score);
                    (passages, top)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Falling back to fused order");
                    state.rerank_degraded = true;
                    (fused_order(&retrieval.candidates, config.top_k_rerank), None)
                }
            };

            state.advance(Stage::Generate)?;
            let request = AnswerRequest {
                query: &state.query,
                passages: &passages,
                max_sentences,
                grounded: true,
            };
            let Some(answer) = self.generate(request, attempt, delivery).await? else {
                return Ok(Flow::Cancelled);
            };

            state.advance(Stage::Validate)?;
            let validation = self.validator.validate(&state.query, &answer.text, &passages);
            let Some(verdict) = delivery.run(validation).await else {
                return Ok(Flow::Cancelled);
            };

            state.attempts.push(record(
                variants.len(),
                retrieval.candidates.len(),
                &passages,
                top_score,
                answer,
                Some(&verdict),
            ));

            if verdict.supported || !state.can_retry() {
                state.advance(Stage::Accept)?;
                return Ok(Flow::Done(finish(state, verdict.supported)));
            }

            let reason = verdict
                .rationale
                .unwrap_or_else(|| "answer not supported by the passages".to_string());
            tracing::warn!(attempt, reason = %reason, "Answer unsupported, retrying");
            state.retry()?;
            if !delivery.send(Fragment::Correction { attempt, reason }).await {
                return Ok(Flow::Cancelled);
            }
            state.advance(Stage::Rewrite)?;
        }
    }

    /// Original query, vector-only retrieval, fused order, no validation.
    async fn run_fast(
        &self,
        state: &mut RunState,
        max_sentences: Option<usize>,
        delivery: &Delivery<'_>,
    ) -> Result<Flow> {
        let config = state.effective_config();
        let variants = vec![state.query.clone()];

        let Some(retrieval) = delivery
            .run(self.retriever.retrieve(&variants, &config, true))
            .await
        else {
            return Ok(Flow::Cancelled);
        };
        let passages = fused_order(&retrieval.candidates, config.top_k_rerank);

        state.advance(Stage::Generate)?;
        let request = AnswerRequest {
            query: &state.query,
            passages: &passages,
            max_sentences,
            grounded: true,
        };
        let Some(answer) = self.generate(request, 1, delivery).await? else {
            return Ok(Flow::Cancelled);
        };

        state.attempts.push(record(
            1,
            retrieval.candidates.len(),
            &passages,
            None,
            answer,
            None,
        ));
        state.advance(Stage::Accept)?;
        Ok(Flow::Done(finish(state, false)))
    }

    /// Generation only.
    async fn run_direct(
        &self,
        state: &mut RunState,
        max_sentences: Option<usize>,
        delivery: &Delivery<'_>,
    ) -> Result<Flow> {
        let request = AnswerRequest {
            query: &state.query,
            passages: &[],
            max_sentences,
            grounded: false,
        };
        let Some(answer) = self.generate(request, 1, delivery).await? else {
            return Ok(Flow::Cancelled);
        };

        state.attempts.push(record(0, 0, &[], None, answer, None));
        state.advance(Stage::Accept)?;
        Ok(Flow::Done(finish(state, false)))
    }

    /// `None` when the run was cancelled mid-generation.
    async fn generate(
        &self,
        request: AnswerRequest<'_>,
        attempt: u32,
        delivery: &Delivery<'_>,
    ) -> Result<Option<Answer>> {
        match delivery {
            Delivery::Atomic => self.generator.generate(request).await.map(Some),
            Delivery::Incremental { tx, cancel } => {
                match self
                    .generator
                    .generate_stream(request, attempt, tx, cancel)
                    .await?
                {
                    Streamed::Completed(answer) => Ok(Some(answer)),
                    Streamed::Cancelled => Ok(None),
                }
            }
        }
    }
}

fn record(
    variants: usize,
    retrieved: usize,
    passages: &[RankedPassage],
    top_score: Option<f32>,
    answer: Answer,
    verdict: Option<&Verdict>,
) -> Attempt {
    Attempt {
        variants,
        retrieved,
        ranked: passages.len(),
        top_score,
        answer: answer.text,
        sources: answer.sources,
        supported: verdict.map(|v| v.supported),
        rationale: verdict.and_then(|v| v.rationale.clone()),
    }
}

fn finish(state: &RunState, validated: bool) -> QueryResult {
    let last = state.attempts.last();
    QueryResult {
        answer: last.map(|a| a.answer.clone()).unwrap_or_default(),
        sources: last.map(|a| a.sources.clone()).unwrap_or_default(),
        was_corrected: state.retries() > 0,
        validated,
        attempts: state.attempts.len() as u32,
        response_time_ms: state.elapsed_ms(),
        cache_hit: false,
        mode: state.mode,
        metadata: ResultMetadata {
            num_rewritten_queries: last.map_or(0, |a| a.variants),
            num_retrieved: last.map_or(0, |a| a.retrieved),
            num_ranked: last.map_or(0, |a| a.ranked),
            retrieval_score: last.and_then(|a| a.top_score),
            validation_reason: last.and_then(|a| a.rationale.clone()),
            rewrite_degraded: state.rewrite_degraded,
            rerank_degraded: state.rerank_degraded,
        },
    }
}

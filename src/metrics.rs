//! Running query counters behind the `/api/metrics` endpoint.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Latency samples kept for percentiles; older ones are dropped first.
const MAX_LATENCY_SAMPLES: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    total_queries: u64,
    corrected: u64,
    unvalidated: u64,
    errors: u64,
    cache_hits: u64,
    latencies_ms: VecDeque<f64>,
}

pub struct MetricsTracker {
    inner: Mutex<Inner>,
    started_at: Mutex<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub total_corrections: u64,
    pub correction_rate: f64,
    pub unvalidated_answers: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub uptime_secs: i64,
}

/// Outcome of one query, as far as metrics care.
#[derive(Debug, Clone, Copy)]
pub enum QueryOutcome {
    Answered {
        latency_ms: f64,
        was_corrected: bool,
        validated: bool,
        cache_hit: bool,
    },
    Failed { latency_ms: f64 },
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            started_at: Mutex::new(Utc::now()),
        }
    }

    pub fn record(&self, outcome: QueryOutcome) {
        let mut inner = self.inner.lock();
        inner.total_queries += 1;
        let latency_ms = match outcome {
            QueryOutcome::Answered {
                latency_ms,
                was_corrected,
                validated,
                cache_hit,
            } => {
                inner.corrected += u64::from(was_corrected);
                inner.unvalidated += u64::from(!validated);
                inner.cache_hits += u64::from(cache_hit);
                latency_ms
            }
            QueryOutcome::Failed { latency_ms } => {
                inner.errors += 1;
                latency_ms
            }
        };
        if inner.latencies_ms.len() >= MAX_LATENCY_SAMPLES {
            inner.latencies_ms.pop_front();
        }
        inner.latencies_ms.push_back(latency_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        let rate = |n: u64| {
            if inner.total_queries == 0 {
                0.0
            } else {
                n as f64 / inner.total_queries as f64
            }
        };

        let mut sorted: Vec<f64> = inner.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        MetricsSnapshot {
            total_queries: inner.total_queries,
            total_corrections: inner.corrected,
            correction_rate: rate(inner.corrected),
            unvalidated_answers: inner.unvalidated,
            error_count: inner.errors,
            error_rate: rate(inner.errors),
            cache_hit_rate: rate(inner.cache_hits),
            avg_latency_ms: avg,
            p95_latency_ms: percentile(&sorted, 95.0),
            p99_latency_ms: percentile(&sorted, 99.0),
            uptime_secs: (Utc::now() - *self.started_at.lock()).num_seconds(),
        }
    }

    pub fn reset(&self) {
        *self.inner.lock() = Inner::default();
        *self.started_at.lock() = Utc::now();
    }
}

/// Linear interpolation between closest ranks over sorted samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = p / 100.0 * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    }
}

//! Advisory result cache. A miss or a failed store never fails a query.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::models::{QueryMode, QueryResult};

/// Key-value store for finished query results.
///
/// Every [`clear`](CacheStore::clear) starts a new epoch. A run reads the
/// epoch before it starts and hands it back to [`set`](CacheStore::set), so
/// an answer computed against a corpus that changed mid-run is dropped.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<QueryResult>;

    /// Current epoch; bumped by every clear.
    fn epoch(&self) -> u64;

    /// Store unless the cache was cleared since `epoch` was read. Last write
    /// wins. Returns whether the value was stored.
    async fn set(&self, key: &str, value: QueryResult, epoch: u64) -> bool;

    async fn clear(&self);
}

/// Cache key over everything that can change the answer.
pub fn cache_key(
    query: &str,
    mode: QueryMode,
    max_sentences: Option<usize>,
    config: &PipelineConfig,
) -> String {
    let config_json = serde_json::to_string(config).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(query.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(mode.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(max_sentences.unwrap_or(0).to_le_bytes());
    hasher.update(b"|");
    hasher.update(config_json.as_bytes());
    format!("rag:{:x}", hasher.finalize())
}

/// In-process LRU with a per-entry time to live.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, (Instant, QueryResult)>>,
    /// Only changed with `entries` locked
    epoch: AtomicU64,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            epoch: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<QueryResult> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some((stored, result)) if stored.elapsed() < self.ttl => return Some(result.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    async fn set(&self, key: &str, value: QueryResult, epoch: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.epoch.load(Ordering::Acquire) != epoch {
            return false;
        }
        entries.put(key.to_string(), (Instant::now(), value));
        true
    }

    async fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

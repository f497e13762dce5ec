//! Shared cache for parameterized queries.
//!
//! Date-range reports (`prod_{start}_{end}`, `losses_{start}_{end}`, ...)
//! are requested by several views at once. Routing them through one cache
//! means identical ranges are fetched once. Keys are kept ordered so a
//! prefix purge only visits the keys it removes.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::layer::CacheLayer;
use crate::lock;
use crate::types::Document;

struct QueryEntry {
    data: Vec<Document>,
    stored_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryCacheEntryStats {
    pub key: String,
    pub len: usize,
    pub age_secs: u64,
    pub fresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryCacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub entries: Vec<QueryCacheEntryStats>,
}

/// TTL-bound cache of query results keyed by caller-chosen strings.
pub struct QueryCache {
    entries: Mutex<BTreeMap<String, QueryEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn fresh(&self, key: &str) -> Option<Vec<Document>> {
        let entries = lock(&self.entries);
        entries
            .get(key)
            .filter(|e| Instant::now().saturating_duration_since(e.stored_at) < self.ttl)
            .map(|e| e.data.clone())
    }

    /// Return the fresh entry for `key`, or await `fetch` and cache its
    /// result. A failed fetch is returned as-is and nothing is stored.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Vec<Document>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Document>, E>>,
    {
        if let Some(data) = self.fresh(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "query cache hit");
            return Ok(data);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "query cache miss");
        let data = fetch().await?;

        lock(&self.entries).insert(
            key.to_string(),
            QueryEntry {
                data: data.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(data)
    }

    pub fn contains_fresh(&self, key: &str) -> bool {
        self.fresh(key).is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn stats(&self) -> QueryCacheStats {
        let now = Instant::now();
        let entries = lock(&self.entries);
        let entries: Vec<QueryCacheEntryStats> = entries
            .iter()
            .map(|(key, entry)| {
                let age = now.saturating_duration_since(entry.stored_at);
                QueryCacheEntryStats {
                    key: key.clone(),
                    len: entry.data.len(),
                    age_secs: age.as_secs(),
                    fresh: age < self.ttl,
                }
            })
            .collect();

        QueryCacheStats {
            size: entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

impl CacheLayer for QueryCache {
    fn name(&self) -> &str {
        "query_cache"
    }

    fn invalidate(&self, key: &str) {
        if lock(&self.entries).remove(key).is_some() {
            debug!(key = %key, "query cache entry invalidated");
        }
    }

    fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = lock(&self.entries);
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        if !doomed.is_empty() {
            debug!(prefix = %prefix, count = doomed.len(), "query cache prefix invalidated");
        }
        doomed.len()
    }

    fn clear(&self) {
        lock(&self.entries).clear();
    }
}

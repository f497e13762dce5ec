//! Timestamped key/value snapshots with freshness queries.
//!
//! The store never expires anything on its own. Callers state how old a
//! value may be on every read, so near-static tables and minute-fresh
//! production counts can share the same mechanism with different budgets.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::event_bus::EventBus;

/// Event emitted after every invalidate-all, following the per-key events.
pub const WILDCARD_INVALIDATED: &str = "state:*:invalidated";

pub fn updated_event(key: &str) -> String {
    format!("state:{}:updated", key)
}

pub fn invalidated_event(key: &str) -> String {
    format!("state:{}:invalidated", key)
}

struct StateEntry {
    data: Value,
    stored_at: Instant,
}

#[derive(Default)]
struct AccessCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccessStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateStoreStats {
    pub keys: Vec<String>,
    pub count: usize,
    /// Age of each entry in whole seconds.
    pub ages_secs: BTreeMap<String, u64>,
    pub access: AccessStats,
    /// `hits / (hits + misses)`, `None` before the first read.
    pub hit_rate: Option<f64>,
}

/// Registry of the latest snapshot per key.
pub struct StateStore {
    entries: DashMap<String, StateEntry>,
    default_ttl: Duration,
    bus: EventBus,
    counters: AccessCounters,
}

impl StateStore {
    pub fn new(bus: EventBus, default_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            default_ttl,
            bus,
            counters: AccessCounters::default(),
        })
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store `data` stamped with the current time and emit
    /// `state:{key}:updated`.
    pub fn set(&self, key: &str, data: Value) {
        self.entries.insert(
            key.to_string(),
            StateEntry {
                data: data.clone(),
                stored_at: Instant::now(),
            },
        );
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, "state set");
        self.bus.emit(&updated_event(key), data);
    }

    /// Last stored value regardless of age.
    pub fn get(&self, key: &str) -> Option<Value> {
        let value = self.entries.get(key).map(|e| e.data.clone());
        let counter = if value.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// When `key` was last stored.
    pub fn timestamp(&self, key: &str) -> Option<Instant> {
        self.entries.get(key).map(|e| e.stored_at)
    }

    /// True iff `key` exists and `now - stored_at < ttl`. `None` uses the
    /// store's default TTL.
    pub fn is_fresh(&self, key: &str, ttl: impl Into<Option<Duration>>) -> bool {
        let ttl = ttl.into().unwrap_or(self.default_ttl);
        self.entries
            .get(key)
            .is_some_and(|e| Instant::now().saturating_duration_since(e.stored_at) < ttl)
    }

    /// The value if it is fresh under `ttl`, else `None` so the caller
    /// fetches.
    pub fn get_if_fresh(&self, key: &str, ttl: impl Into<Option<Duration>>) -> Option<Value> {
        if self.is_fresh(key, ttl) {
            self.get(key)
        } else {
            None
        }
    }

    /// Drop one key, or every key when `None`.
    ///
    /// Emits `state:{key}:invalidated` for each entry actually removed and,
    /// for the invalidate-all form, `state:*:invalidated` afterwards when
    /// anything was removed. Invalidating an absent key is a silent no-op.
    pub fn invalidate(&self, key: Option<&str>) {
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);

        match key {
            Some(key) => {
                if self.entries.remove(key).is_some() {
                    debug!(key = %key, "state invalidated");
                    self.bus.emit(&invalidated_event(key), Value::Null);
                }
            }
            None => {
                let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
                let removed: Vec<String> = keys
                    .into_iter()
                    .filter(|k| self.entries.remove(k).is_some())
                    .collect();
                if removed.is_empty() {
                    return;
                }
                debug!(count = removed.len(), "state invalidated (all)");
                for key in &removed {
                    self.bus.emit(&invalidated_event(key), Value::Null);
                }
                self.bus.emit(WILDCARD_INVALIDATED, Value::Null);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> StateStoreStats {
        let now = Instant::now();
        let mut ages_secs = BTreeMap::new();
        for entry in self.entries.iter() {
            let age = now.saturating_duration_since(entry.stored_at).as_secs();
            ages_secs.insert(entry.key().clone(), age);
        }
        let keys: Vec<String> = ages_secs.keys().cloned().collect();

        let access = AccessStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        };
        let reads = access.hits + access.misses;
        let hit_rate = (reads > 0).then(|| access.hits as f64 / reads as f64);

        StateStoreStats {
            count: keys.len(),
            keys,
            ages_secs,
            access,
            hit_rate,
        }
    }

    pub fn reset_stats(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.sets.store(0, Ordering::Relaxed);
        self.counters.invalidations.store(0, Ordering::Relaxed);
    }
}

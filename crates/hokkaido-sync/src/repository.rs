//! Cache-first CRUD façade over one remote collection.
//!
//! Reads are served from an in-memory TTL cache keyed by the structural
//! encoding of the query. Every write clears the repository's cache so a
//! read issued after the write completes always sees it. Named live
//! subscriptions keep the cache warm between reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::collection::Collection;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::event_bus::{EventBus, ListenerResult, invoke_listener};
use crate::layer::CacheLayer;
use crate::lock;
use crate::remote::{
    CREATED_AT_FIELD, CancelHandle, Listener, RemoteStore, Snapshot,
    StoreError, UPDATED_AT_FIELD,
};
use crate::state_store::StateStore;
use crate::types::{Document, Fields, QueryFilters, documents_to_value};

struct CacheEntry {
    data: Vec<Document>,
    captured_at: Instant,
}

type SubscriptionCallback = Arc<dyn Fn(&[Document]) -> ListenerResult + Send + Sync>;

struct ActiveSubscription {
    generation: u64,
    cancelled: Arc<AtomicBool>,
    cancel: CancelHandle,
    pump: AbortHandle,
}

impl ActiveSubscription {
    fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.pump.abort();
        self.cancel.cancel();
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_queries: usize,
    pub subscriptions: usize,
}

/// Handle to a named subscription.
///
/// Only cancels the subscription it was returned for: once the name has
/// been re-registered, the old handle is inert.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    repository: Weak<Repository>,
    name: String,
    generation: u64,
}

impl SubscriptionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unsubscribe(&self) -> bool {
        match self.repository.upgrade() {
            Some(repo) => repo.remove_subscription(&self.name, Some(self.generation)),
            None => false,
        }
    }
}

/// Cache-first access to a single collection.
pub struct Repository {
    collection: String,
    store: Arc<dyn RemoteStore>,
    state: Arc<StateStore>,
    bus: EventBus,
    ttl: Duration,
    max_batch_size: usize,
    legacy: Option<Arc<dyn CacheLayer>>,
    cache: DashMap<String, CacheEntry>,
    subscriptions: Mutex<HashMap<String, ActiveSubscription>>,
    next_generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Builder for [`Repository`].
pub struct RepositoryBuilder {
    collection: String,
    store: Arc<dyn RemoteStore>,
    state: Arc<StateStore>,
    bus: EventBus,
    ttl: Duration,
    max_batch_size: usize,
    legacy: Option<Arc<dyn CacheLayer>>,
}

impl RepositoryBuilder {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Older cache that may still hold copies of this collection.
    pub fn legacy_layer(mut self, layer: Arc<dyn CacheLayer>) -> Self {
        self.legacy = Some(layer);
        self
    }

    pub fn build(self) -> Arc<Repository> {
        Arc::new(Repository {
            collection: self.collection,
            store: self.store,
            state: self.state,
            bus: self.bus,
            ttl: self.ttl,
            max_batch_size: self.max_batch_size,
            legacy: self.legacy,
            cache: DashMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }
}

impl Repository {
    /// Builder with the TTL and batch size of [`SyncConfig::default`].
    pub fn builder(
        collection: impl Into<String>,
        store: Arc<dyn RemoteStore>,
        state: Arc<StateStore>,
        bus: EventBus,
    ) -> RepositoryBuilder {
        Self::from_config(collection, store, state, bus, &SyncConfig::default())
    }

    /// Builder taking its TTL from `default_repository_ttl_secs` and its
    /// batch size from `config`.
    pub fn from_config(
        collection: impl Into<String>,
        store: Arc<dyn RemoteStore>,
        state: Arc<StateStore>,
        bus: EventBus,
        config: &SyncConfig,
    ) -> RepositoryBuilder {
        RepositoryBuilder {
            collection: collection.into(),
            store,
            state,
            bus,
            ttl: config.default_repository_ttl(),
            max_batch_size: config.max_batch_size,
            legacy: None,
        }
    }

    /// Repository for a catalogued collection with its own TTL.
    pub fn for_collection(
        collection: Collection,
        store: Arc<dyn RemoteStore>,
        state: Arc<StateStore>,
        bus: EventBus,
        config: &SyncConfig,
    ) -> Arc<Self> {
        Self::from_config(collection.as_str(), store, state, bus, config)
            .ttl(collection.default_ttl())
            .build()
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        Instant::now().saturating_duration_since(entry.captured_at) < self.ttl
    }

    fn cached(&self, key: &str) -> Option<Vec<Document>> {
        if let Some(entry) = self.cache.get(key)
            && self.is_fresh(&entry)
        {
            return Some(entry.data.clone());
        }
        self.cache.remove_if(key, |_, entry| !self.is_fresh(entry));
        None
    }

    fn store_entry(&self, key: String, data: &[Document]) {
        self.cache.insert(
            key,
            CacheEntry {
                data: data.to_vec(),
                captured_at: Instant::now(),
            },
        );
    }

    fn read_error(&self, source: StoreError) -> SyncError {
        SyncError::RemoteRead {
            collection: self.collection.clone(),
            source,
        }
    }

    fn write_error(&self, source: StoreError) -> SyncError {
        SyncError::RemoteWrite {
            collection: self.collection.clone(),
            source,
        }
    }

    /// Documents matching `filters`, from cache when fresh.
    ///
    /// `force_refresh` always goes to the remote store. A fetch over the
    /// whole collection is also published to the [`StateStore`] under the
    /// collection name.
    pub async fn get_all(
        &self,
        filters: &QueryFilters,
        force_refresh: bool,
    ) -> Result<Vec<Document>, SyncError> {
        let key = filters.cache_key(&self.collection);

        if !force_refresh && let Some(data) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(collection = %self.collection, key = %key, "cache hit");
            return Ok(data);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(collection = %self.collection, key = %key, force_refresh, "cache miss");

        let data = self
            .store
            .query(&self.collection, filters)
            .await
            .map_err(|source| self.read_error(source))?;

        self.store_entry(key, &data);
        if filters.is_empty() {
            self.state.set(&self.collection, documents_to_value(&data));
        }
        Ok(data)
    }

    /// One document by id. A fresh whole-collection entry is consulted
    /// first, so no remote read is issued for an id it contains.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Document>, SyncError> {
        let whole = QueryFilters::new().cache_key(&self.collection);
        if let Some(entry) = self.cache.get(&whole)
            && self.is_fresh(&entry)
            && let Some(doc) = entry.data.iter().find(|d| d.id == id)
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(doc.clone()));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.store
            .get(&self.collection, id)
            .await
            .map_err(|source| self.read_error(source))
    }

    /// Create a document and return its generated id.
    pub async fn create(&self, fields: Fields) -> Result<String, SyncError> {
        let id = self
            .store
            .create(&self.collection, fields.clone(), CREATED_AT_FIELD)
            .await
            .map_err(|source| self.write_error(source))?;

        self.invalidate_cache();
        self.bus.emit(
            &format!("{}:created", self.collection),
            json!({ "id": id, "data": Value::Object(fields) }),
        );
        Ok(id)
    }

    pub async fn update(&self, id: &str, fields: Fields) -> Result<(), SyncError> {
        self.store
            .update(&self.collection, id, fields.clone(), UPDATED_AT_FIELD)
            .await
            .map_err(|source| self.write_error(source))?;

        self.invalidate_cache();
        self.bus.emit(
            &format!("{}:updated", self.collection),
            json!({ "id": id, "data": Value::Object(fields) }),
        );
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        self.store
            .delete(&self.collection, id)
            .await
            .map_err(|source| self.write_error(source))?;

        self.invalidate_cache();
        self.bus
            .emit(&format!("{}:deleted", self.collection), json!({ "id": id }));
        Ok(())
    }

    /// Delete `ids` in committed batches, returning how many were deleted.
    ///
    /// Stops at the first failing batch. The cache is invalidated either
    /// way, since earlier batches may already have committed.
    pub async fn delete_many(&self, ids: &[String]) -> Result<usize, SyncError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let chunk_size = self
            .max_batch_size
            .min(self.store.max_batch_size())
            .max(1);

        for (index, chunk) in ids.chunks(chunk_size).enumerate() {
            if let Err(source) = self.store.commit_batch_delete(&self.collection, chunk).await {
                self.invalidate_cache();
                let start = index * chunk_size;
                warn!(
                    collection = %self.collection,
                    chunk = index,
                    unprocessed = ids.len() - start,
                    error = %source,
                    "batch delete aborted"
                );
                return Err(SyncError::BatchChunk {
                    collection: self.collection.clone(),
                    chunk: index,
                    unprocessed: start..ids.len(),
                    source,
                });
            }
            debug!(collection = %self.collection, chunk = index, size = chunk.len(), "batch committed");
        }

        self.invalidate_cache();
        self.bus.emit(
            &format!("{}:deletedMany", self.collection),
            json!({ "ids": ids, "count": ids.len() }),
        );
        Ok(ids.len())
    }

    /// Open a named live subscription.
    ///
    /// Any subscription already registered under `name` is cancelled first.
    /// Each push refreshes the cache entry for the query (and the
    /// [`StateStore`] for unfiltered subscriptions) before `callback` runs.
    pub async fn subscribe<F>(
        self: &Arc<Self>,
        name: &str,
        filters: Option<QueryFilters>,
        callback: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(&[Document]) -> ListenerResult + Send + Sync + 'static,
    {
        self.remove_subscription(name, None);

        let filters = filters.unwrap_or_default();
        let Listener { snapshots, cancel } = self
            .store
            .listen(&self.collection, &filters)
            .await
            .map_err(|source| SyncError::Subscription {
                collection: self.collection.clone(),
                source,
            })?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_subscription(
            Arc::downgrade(self),
            name.to_string(),
            generation,
            filters,
            Arc::clone(&cancelled),
            snapshots,
            Arc::new(callback),
        ));

        let active = ActiveSubscription {
            generation,
            cancelled,
            cancel,
            pump: pump.abort_handle(),
        };
        let replaced = lock(&self.subscriptions).insert(name.to_string(), active);
        if let Some(replaced) = replaced {
            // A concurrent subscribe with the same name got in between
            replaced.cancel();
        }

        info!(collection = %self.collection, name = %name, "subscription opened");
        Ok(SubscriptionHandle {
            repository: Arc::downgrade(self),
            name: name.to_string(),
            generation,
        })
    }

    /// Cancel the subscription registered under `name`.
    pub fn unsubscribe(&self, name: &str) -> bool {
        self.remove_subscription(name, None)
    }

    pub fn unsubscribe_all(&self) {
        let drained: Vec<ActiveSubscription> = lock(&self.subscriptions)
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        if !drained.is_empty() {
            info!(collection = %self.collection, count = drained.len(), "subscriptions closed");
        }
        for sub in drained {
            sub.cancel();
        }
    }

    /// Names of the open subscriptions, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        names.sort();
        names
    }

    fn remove_subscription(&self, name: &str, generation: Option<u64>) -> bool {
        let removed = {
            let mut subscriptions = lock(&self.subscriptions);
            match subscriptions.get(name) {
                Some(sub) if generation.is_none_or(|g| g == sub.generation) => {
                    subscriptions.remove(name)
                }
                _ => None,
            }
        };
        match removed {
            Some(sub) => {
                debug!(collection = %self.collection, name = %name, "subscription closed");
                sub.cancel();
                true
            }
            None => false,
        }
    }

    fn apply_push(
        &self,
        filters: &QueryFilters,
        snapshot: &Snapshot,
        cancelled: &AtomicBool,
        callback: &SubscriptionCallback,
    ) {
        self.store_entry(filters.cache_key(&self.collection), &snapshot.documents);
        if filters.is_empty() {
            self.state
                .set(&self.collection, documents_to_value(&snapshot.documents));
        }

        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        if let Err(failure) = invoke_listener(|| callback(&snapshot.documents)) {
            error!(collection = %self.collection, error = %failure, "subscription callback failed");
        }
    }

    /// Drop every cached query, the StateStore entry and the legacy
    /// layer's copy. Safe to call repeatedly.
    pub fn invalidate_cache(&self) {
        self.cache.clear();
        self.state.invalidate(Some(&self.collection));
        if let Some(legacy) = &self.legacy {
            legacy.invalidate(&self.collection);
        }
        debug!(collection = %self.collection, "repository cache invalidated");
    }

    pub fn read_stats(&self) -> ReadStats {
        ReadStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached_queries: self.cache.len(),
            subscriptions: lock(&self.subscriptions).len(),
        }
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, sub) in subscriptions.drain() {
            sub.cancel();
        }
    }
}

async fn pump_subscription(
    repository: Weak<Repository>,
    name: String,
    generation: u64,
    filters: QueryFilters,
    cancelled: Arc<AtomicBool>,
    mut snapshots: mpsc::UnboundedReceiver<Result<Snapshot, StoreError>>,
    callback: SubscriptionCallback,
) {
    while let Some(item) = snapshots.recv().await {
        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        let Some(repo) = repository.upgrade() else {
            return;
        };
        match item {
            Ok(snapshot) => repo.apply_push(&filters, &snapshot, &cancelled, &callback),
            Err(source) => {
                let err = SyncError::Subscription {
                    collection: repo.collection.clone(),
                    source,
                };
                error!(name = %name, error = %err, "subscription stream failed");
                repo.remove_subscription(&name, Some(generation));
                return;
            }
        }
    }
    debug!(name = %name, "subscription stream ended");
}

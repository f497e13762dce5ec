//! Write-driven invalidation across every cache layer.
//!
//! After a write to a collection, every layer that may hold a derived copy
//! has to be purged: the StateStore keys other views read, the registered
//! repository, the shared query cache, an optional legacy cache and, for
//! machine-status collections, the status side-cache. The routing table is
//! an exhaustive match over [`Collection`], so a new collection does not
//! compile until it is mapped.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::collection::Collection;
use crate::event_bus::EventBus;
use crate::layer::CacheLayer;
use crate::lock;
use crate::query_cache::QueryCache;
use crate::repository::Repository;
use crate::state_store::StateStore;

/// A key to drop from a cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey {
    Exact(&'static str),
    /// Every key starting with this prefix.
    Prefix(&'static str),
}

impl CacheKey {
    fn apply(self, layer: &dyn CacheLayer) {
        match self {
            CacheKey::Exact(key) => layer.invalidate(key),
            CacheKey::Prefix(prefix) => {
                layer.invalidate_prefix(prefix);
            }
        }
    }
}

/// Everything to purge after a write to one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationTargets {
    /// StateStore keys read by other views, besides the collection's own
    /// wire name which is always dropped.
    pub state_keys: &'static [&'static str],
    /// Keys in the legacy cache layer.
    pub legacy_keys: &'static [CacheKey],
    /// Keys in the shared query cache.
    pub query_keys: &'static [CacheKey],
    /// Clear the repository registered for the collection.
    pub repository: bool,
    /// Clear the machine-status side-cache.
    pub status_cache: bool,
    /// Events emitted with `{ collection, extraKey }`.
    pub events: &'static [&'static str],
}

const NOTHING: InvalidationTargets = InvalidationTargets {
    state_keys: &[],
    legacy_keys: &[],
    query_keys: &[],
    repository: false,
    status_cache: false,
    events: &[],
};

/// Routing table entry for `collection`.
pub fn targets(collection: Collection) -> InvalidationTargets {
    use CacheKey::{Exact, Prefix};

    match collection {
        Collection::ProductionEntries => InvalidationTargets {
            state_keys: &["productionEntries"],
            legacy_keys: &[
                Exact("productionEntries"),
                Exact("production_entries"),
                Prefix("prod_"),
            ],
            query_keys: &[Prefix("prod_"), Prefix("losses_")],
            repository: true,
            status_cache: false,
            events: &["production_entries:changed"],
        },
        Collection::ProductionOrders => InvalidationTargets {
            state_keys: &["productionOrders"],
            legacy_keys: &[Exact("productionOrders"), Exact("production_orders")],
            query_keys: &[],
            repository: true,
            status_cache: false,
            events: &["production_orders:changed"],
        },
        Collection::Planning => InvalidationTargets {
            state_keys: &["planning"],
            legacy_keys: &[Exact("planning"), Prefix("plan_")],
            query_keys: &[Prefix("plan_")],
            repository: true,
            status_cache: false,
            events: &["planning:changed"],
        },
        Collection::ActiveDowntimes => InvalidationTargets {
            state_keys: &["activeDowntimes"],
            legacy_keys: &[Exact("activeDowntimes"), Exact("active_downtimes")],
            query_keys: &[],
            repository: true,
            status_cache: true,
            events: &["active_downtimes:changed"],
        },
        Collection::DowntimeEntries => InvalidationTargets {
            state_keys: &["downtimeEntries"],
            legacy_keys: &[
                Exact("downtimeEntries"),
                Exact("downtime_entries"),
                Prefix("down_"),
            ],
            query_keys: &[Prefix("down_")],
            repository: true,
            status_cache: true,
            events: &["downtime_entries:changed"],
        },
        Collection::ExtendedDowntimeLogs => InvalidationTargets {
            state_keys: &["extendedDowntimeLogs"],
            legacy_keys: &[
                Exact("extendedDowntimeLogs"),
                Exact("extended_downtime_logs"),
            ],
            query_keys: &[],
            repository: true,
            status_cache: true,
            events: &["extended_downtime_logs:changed"],
        },
        Collection::QuantityAdjustments => InvalidationTargets {
            legacy_keys: &[Exact("quantity_adjustments")],
            repository: true,
            ..NOTHING
        },
        Collection::ReworkEntries => InvalidationTargets {
            legacy_keys: &[Exact("rework_entries")],
            repository: true,
            ..NOTHING
        },
        Collection::TriageEntries => InvalidationTargets {
            legacy_keys: &[Exact("triage_entries")],
            repository: true,
            ..NOTHING
        },
        // Write-only: nothing caches it
        Collection::SystemLogs => NOTHING,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub writes: u64,
    pub invalidations: u64,
    pub collections: Vec<&'static str>,
    pub repositories: Vec<String>,
    /// Unknown collection names seen, sorted.
    pub unmapped: Vec<String>,
}

/// Executes the routing table against the configured cache layers.
pub struct InvalidationRouter {
    bus: EventBus,
    state: Arc<StateStore>,
    query_cache: Option<Arc<QueryCache>>,
    legacy: Option<Arc<dyn CacheLayer>>,
    status_cache: Option<Arc<dyn CacheLayer>>,
    repositories: DashMap<Collection, Arc<Repository>>,
    unmapped: Mutex<HashSet<String>>,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

/// Builder for [`InvalidationRouter`]. Every layer is optional.
pub struct InvalidationRouterBuilder {
    bus: EventBus,
    state: Arc<StateStore>,
    query_cache: Option<Arc<QueryCache>>,
    legacy: Option<Arc<dyn CacheLayer>>,
    status_cache: Option<Arc<dyn CacheLayer>>,
}

impl InvalidationRouterBuilder {
    pub fn query_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.query_cache = Some(cache);
        self
    }

    pub fn legacy_layer(mut self, layer: Arc<dyn CacheLayer>) -> Self {
        self.legacy = Some(layer);
        self
    }

    /// Cache of machine status keyed by machine id.
    pub fn status_cache(mut self, layer: Arc<dyn CacheLayer>) -> Self {
        self.status_cache = Some(layer);
        self
    }

    pub fn build(self) -> Arc<InvalidationRouter> {
        Arc::new(InvalidationRouter {
            bus: self.bus,
            state: self.state,
            query_cache: self.query_cache,
            legacy: self.legacy,
            status_cache: self.status_cache,
            repositories: DashMap::new(),
            unmapped: Mutex::new(HashSet::new()),
            writes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        })
    }
}

impl InvalidationRouter {
    pub fn builder(bus: EventBus, state: Arc<StateStore>) -> InvalidationRouterBuilder {
        InvalidationRouterBuilder {
            bus,
            state,
            query_cache: None,
            legacy: None,
            status_cache: None,
        }
    }

    /// Route invalidations for `collection` to `repository` as well.
    pub fn register_repository(&self, collection: Collection, repository: Arc<Repository>) {
        self.repositories.insert(collection, repository);
    }

    /// Purge every layer mapped for `collection` and emit its events.
    ///
    /// `extra_key` narrows the status side-cache purge to one machine and
    /// is forwarded in the event payload.
    pub fn invalidate_collection(&self, collection: Collection, extra_key: Option<&str>) {
        let count = self.invalidations.fetch_add(1, Ordering::Relaxed) + 1;
        let targets = targets(collection);
        debug!(collection = %collection, count, "invalidating after write");

        self.state.invalidate(Some(collection.as_str()));
        for &key in targets.state_keys {
            self.state.invalidate(Some(key));
        }

        if targets.repository {
            let repository = self
                .repositories
                .get(&collection)
                .map(|r| Arc::clone(r.value()));
            if let Some(repository) = repository {
                repository.invalidate_cache();
            }
        }

        if let Some(cache) = &self.query_cache {
            for key in targets.query_keys {
                key.apply(&**cache);
            }
        }

        if let Some(legacy) = &self.legacy {
            for key in targets.legacy_keys {
                key.apply(legacy.as_ref());
            }
        }

        if targets.status_cache
            && let Some(status) = &self.status_cache
        {
            match extra_key {
                Some(machine) => status.invalidate(machine),
                None => status.clear(),
            }
        }

        for event in targets.events {
            self.bus.emit(
                event,
                json!({ "collection": collection.as_str(), "extraKey": extra_key }),
            );
        }
    }

    /// Invalidate by runtime collection name.
    ///
    /// Unknown names are a no-op, logged once per distinct name. Returns
    /// whether the name was mapped.
    pub fn invalidate_cache_for_collection(&self, name: &str, extra_key: Option<&str>) -> bool {
        match name.parse::<Collection>() {
            Ok(collection) => {
                self.invalidate_collection(collection, extra_key);
                true
            }
            Err(_) => {
                if lock(&self.unmapped).insert(name.to_string()) {
                    warn!(collection = %name, "write to collection without cache mapping");
                }
                false
            }
        }
    }

    /// Await `write`, then invalidate `collection` only if it succeeded.
    ///
    /// A failing write is returned unchanged and nothing is invalidated.
    pub async fn invalidate_after_write<T, E, Fut>(
        &self,
        collection: Collection,
        write: Fut,
        extra_key: Option<&str>,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let value = write.await?;
        self.invalidate_collection(collection, extra_key);
        Ok(value)
    }

    pub fn stats(&self) -> RouterStats {
        let mut unmapped: Vec<String> = lock(&self.unmapped).iter().cloned().collect();
        unmapped.sort();
        let mut repositories: Vec<String> = self
            .repositories
            .iter()
            .map(|r| r.key().as_str().to_string())
            .collect();
        repositories.sort();

        RouterStats {
            writes: self.writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            collections: Collection::ALL.iter().map(|c| c.as_str()).collect(),
            repositories,
            unmapped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::Value;

    #[derive(Default)]
    struct RecordingLayer {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingLayer {
        fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }
    }

    impl CacheLayer for RecordingLayer {
        fn name(&self) -> &str {
            "recording"
        }

        fn invalidate(&self, key: &str) {
            lock(&self.calls).push(format!("key:{}", key));
        }

        fn invalidate_prefix(&self, prefix: &str) -> usize {
            lock(&self.calls).push(format!("prefix:{}", prefix));
            0
        }

        fn clear(&self) {
            lock(&self.calls).push("clear".to_string());
        }
    }

    fn router_with(
        legacy: Option<Arc<RecordingLayer>>,
        status: Option<Arc<RecordingLayer>>,
    ) -> (Arc<InvalidationRouter>, Arc<StateStore>, EventBus) {
        let bus = EventBus::new();
        let state = StateStore::new(bus.clone(), Duration::from_secs(300));
        let mut builder = InvalidationRouter::builder(bus.clone(), Arc::clone(&state));
        if let Some(legacy) = legacy {
            builder = builder.legacy_layer(legacy);
        }
        if let Some(status) = status {
            builder = builder.status_cache(status);
        }
        (builder.build(), state, bus)
    }

    #[test]
    fn test_every_collection_has_targets() {
        for collection in Collection::ALL {
            let t = targets(collection);
            for event in t.events {
                assert!(event.starts_with(collection.as_str()));
            }
        }
        assert_eq!(targets(Collection::SystemLogs), NOTHING);
        assert!(targets(Collection::DowntimeEntries).status_cache);
        assert!(!targets(Collection::Planning).status_cache);
    }

    #[test]
    fn test_invalidation_hits_every_layer() {
        let legacy = Arc::new(RecordingLayer::default());
        let status = Arc::new(RecordingLayer::default());
        let (router, state, bus) = router_with(Some(Arc::clone(&legacy)), Some(Arc::clone(&status)));
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&payloads);
        bus.on("downtime_entries:changed", move |data| {
            lock(&sink).push(data.clone());
            Ok(())
        });
        state.set("downtimeEntries", json!([]));

        router.invalidate_collection(Collection::DowntimeEntries, Some("H07"));

        assert!(!state.has("downtimeEntries"));
        assert_eq!(
            legacy.calls(),
            vec!["key:downtimeEntries", "key:downtime_entries", "prefix:down_"]
        );
        assert_eq!(status.calls(), vec!["key:H07"]);
        assert_eq!(
            *lock(&payloads),
            vec![json!({"collection": "downtime_entries", "extraKey": "H07"})]
        );
    }

    #[test]
    fn test_status_cache_cleared_without_machine() {
        let status = Arc::new(RecordingLayer::default());
        let (router, _, _) = router_with(None, Some(Arc::clone(&status)));

        router.invalidate_collection(Collection::ActiveDowntimes, None);
        router.invalidate_collection(Collection::Planning, None);

        assert_eq!(status.calls(), vec!["clear"]);
    }

    #[test]
    fn test_missing_optional_layers_are_tolerated() {
        let (router, _, bus) = router_with(None, None);
        let events = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&events);
        bus.on("production_entries:changed", move |data| {
            lock(&sink).push(data.clone());
            Ok(())
        });

        assert!(router.invalidate_cache_for_collection("production_entries", None));
        assert_eq!(lock(&events)[0]["extraKey"], Value::Null);
    }

    #[tokio::test]
    async fn test_query_cache_prefixes_are_purged() {
        let bus = EventBus::new();
        let state = StateStore::new(bus.clone(), Duration::from_secs(300));
        let cache = Arc::new(QueryCache::new(Duration::from_secs(300)));
        for key in ["prod_2026-02-01_2026-02-07", "losses_2026-02-01", "plan_2026-02-20"] {
            cache
                .get_or_fetch(key, || async { Ok::<_, String>(Vec::new()) })
                .await
                .unwrap();
        }
        let router = InvalidationRouter::builder(bus, state)
            .query_cache(Arc::clone(&cache))
            .build();

        router.invalidate_collection(Collection::ProductionEntries, None);

        assert!(!cache.contains_fresh("prod_2026-02-01_2026-02-07"));
        assert!(!cache.contains_fresh("losses_2026-02-01"));
        assert!(cache.contains_fresh("plan_2026-02-20"));
    }

    #[test]
    fn test_unmapped_name_is_reported_once() {
        let (router, _, _) = router_with(None, None);

        assert!(!router.invalidate_cache_for_collection("maintenance_tickets", None));
        assert!(!router.invalidate_cache_for_collection("maintenance_tickets", None));
        assert!(!router.invalidate_cache_for_collection("orders", None));

        let stats = router.stats();
        assert_eq!(stats.unmapped, vec!["maintenance_tickets", "orders"]);
        assert_eq!(stats.invalidations, 0);
        assert_eq!(stats.collections.len(), Collection::ALL.len());
    }

    #[tokio::test]
    async fn test_after_write_invalidates_only_on_success() {
        let (router, state, _) = router_with(None, None);
        state.set("productionOrders", json!([]));

        let failed: Result<String, &str> = router
            .invalidate_after_write(
                Collection::ProductionOrders,
                async { Err("permission denied") },
                None,
            )
            .await;
        assert_eq!(failed, Err("permission denied"));
        assert!(state.has("productionOrders"));

        let id = router
            .invalidate_after_write(
                Collection::ProductionOrders,
                async { Ok::<_, &str>("order-1".to_string()) },
                None,
            )
            .await
            .unwrap();
        assert_eq!(id, "order-1");
        assert!(!state.has("productionOrders"));

        let stats = router.stats();
        assert_eq!((stats.writes, stats.invalidations), (2, 1));
    }

    #[tokio::test]
    async fn test_routed_write_drops_repository_snapshot_without_registration() {
        use crate::memory_store::MemoryStore;
        use crate::remote::RemoteStore;
        use crate::types::Document;

        let store = Arc::new(MemoryStore::new());
        store.seed(
            "production_entries",
            [Document::new("e1", json!({"q": 1}).as_object().cloned().unwrap())],
        );
        let (router, state, bus) = router_with(None, None);
        let repo = Repository::builder(
            "production_entries",
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            Arc::clone(&state),
            bus,
        )
        .build();
        repo.get_all(&crate::types::QueryFilters::new(), false)
            .await
            .unwrap();
        assert!(state.has("production_entries"));

        router
            .invalidate_after_write(
                Collection::ProductionEntries,
                store.create(
                    "production_entries",
                    json!({"q": 2}).as_object().cloned().unwrap(),
                    crate::remote::CREATED_AT_FIELD,
                ),
                None,
            )
            .await
            .unwrap();

        assert!(!state.has("production_entries"));
        assert!(router.stats().repositories.is_empty());
    }
}

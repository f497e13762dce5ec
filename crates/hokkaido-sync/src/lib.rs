//! Cache and synchronization core for the Hokkaido shop-floor dashboard.
//!
//! This crate keeps dashboard consumers close to the remote document store
//! without hammering it:
//! - Cache-first repositories with per-collection freshness windows
//! - A push-subscribed live mirror of one high-churn collection
//! - Write routing that purges every cache layer holding derived data
//! - A synchronous event bus for change notifications
//!
//! ## Features
//!
//! - **Repository**: TTL cache plus named live subscriptions per collection
//! - **LiveMirror**: delta-tracked in-memory copy with O(1) machine lookup
//! - **InvalidationRouter**: typed collection → cache-layer routing table
//! - **QueryCache**: shared cache for parameterized (date-range) queries
//! - **MemoryStore**: in-memory remote store with real push subscriptions

use std::sync::{Mutex, MutexGuard, PoisonError};

mod collection;
mod config;
mod error;
mod event_bus;
mod invalidation;
mod layer;
mod memory_store;
mod mirror;
mod query_cache;
mod remote;
mod repository;
mod state_store;
mod types;

pub use collection::{Collection, UnknownCollection};
pub use config::SyncConfig;
pub use error::SyncError;
pub use event_bus::{
    EmittedEvent, EventBus, EventBusStats, ListenerError, ListenerHandle, ListenerId,
    ListenerResult,
};
pub use invalidation::{
    CacheKey, InvalidationRouter, InvalidationRouterBuilder, InvalidationTargets, RouterStats,
    targets,
};
pub use layer::CacheLayer;
pub use memory_store::MemoryStore;
pub use mirror::{
    DeltaEvent, LiveMirror, LiveMirrorBuilder, MirrorState, MirrorStats, MirrorStatus,
    MirrorSubscription, ReplayPolicy, SnapshotOutcome, Visibility, normalize_key,
};
pub use query_cache::{QueryCache, QueryCacheEntryStats, QueryCacheStats};
pub use remote::{
    CREATED_AT_FIELD, CancelHandle, ChangeKind, DEFAULT_MAX_BATCH_SIZE, DocumentChange, Listener,
    RemoteStore, Snapshot, StoreError, UPDATED_AT_FIELD,
};
pub use repository::{ReadStats, Repository, RepositoryBuilder, SubscriptionHandle};
pub use state_store::{AccessStats, StateStore, StateStoreStats, WILDCARD_INVALIDATED};
pub use types::{
    Direction, Document, Fields, FilterOp, OrderBy, QueryFilters, WhereClause, documents_to_value,
};

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// Listener callbacks run under `catch_unwind`, so a poisoned lock only
/// means a panic was already reported.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Push-subscribed, delta-tracked mirror of one high-churn collection.
//!
//! The dashboard keeps machine status (which machines are currently down)
//! in memory through a push subscription instead of polling. Snapshot
//! handling is split in two:
//!
//! - [`MirrorState`] is the pure part: replay filtering, delta accounting
//!   and the normalized-key index. No runtime needed.
//! - [`LiveMirror`] owns the subscription lifecycle: start, stop,
//!   pause/resume on visibility, and a single delayed restart after a
//!   subscription failure.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::event_bus::{EventBus, ListenerResult, invoke_listener};
use crate::lock;
use crate::remote::{CancelHandle, ChangeKind, Listener, RemoteStore, Snapshot, StoreError};
use crate::types::{Document, QueryFilters, documents_to_value};

/// Letters followed by a one- or two-digit suffix, after separators are
/// stripped.
static MACHINE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z]+)(\d{1,2})$").unwrap());

/// Normalize a machine key for index build and lookup.
///
/// Trims, upper-cases and strips whitespace, `-` and `_`. A key made of
/// letters and a one- or two-digit number gets the number zero-padded to
/// two digits, so `"h1"`, `"H-1"` and `"h 01"` all become `"H01"`.
pub fn normalize_key(raw: &str) -> String {
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_uppercase)
        .collect();

    match MACHINE_KEY_RE.captures(&compact) {
        Some(caps) => format!("{}{:0>2}", &caps[1], &caps[2]),
        None => compact,
    }
}

/// What to do with a snapshot replayed from the local cache after the
/// first snapshot of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Drop the replay entirely.
    #[default]
    Discard,
    /// Diff the replay against the current documents and apply it only if
    /// it contains changes.
    DiffAndApply,
}

/// Page visibility as reported by the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Lifecycle of a mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorStatus {
    #[default]
    Stopped,
    /// Subscription requested, not yet open.
    Starting,
    Active,
    Paused,
}

/// A single per-document change between two applied snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub doc_id: String,
    /// `None` iff `kind` is `Removed`.
    pub doc: Option<Document>,
}

/// Result of offering a snapshot to [`MirrorState::apply_snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    Applied(Vec<DeltaEvent>),
    IgnoredReplay,
}

/// Documents, index and counters of a mirror.
#[derive(Debug, Clone, Default)]
pub struct MirrorState {
    documents: Vec<Document>,
    /// Normalized key → position in `documents`.
    by_key: HashMap<String, usize>,
    snapshot_count: u64,
    delta_count: u64,
    snapshots_since_start: u64,
    last_update: Option<DateTime<Utc>>,
    status: MirrorStatus,
}

impl MirrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn get(&self, key: &str) -> Option<&Document> {
        self.by_key
            .get(&normalize_key(key))
            .and_then(|&i| self.documents.get(i))
    }

    pub fn snapshot_count(&self) -> u64 {
        self.snapshot_count
    }

    pub fn delta_count(&self) -> u64 {
        self.delta_count
    }

    pub fn snapshots_since_start(&self) -> u64 {
        self.snapshots_since_start
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn status(&self) -> MirrorStatus {
        self.status
    }

    pub fn has_data(&self) -> bool {
        self.snapshot_count > 0
    }

    /// A `start()` began: the next snapshot is the first of the session.
    pub fn begin_session(&mut self) {
        self.status = MirrorStatus::Starting;
        self.snapshots_since_start = 0;
    }

    /// The subscription is open.
    pub fn activate(&mut self) {
        if self.status == MirrorStatus::Starting {
            self.status = MirrorStatus::Active;
        }
    }

    pub fn mark_paused(&mut self) {
        self.status = MirrorStatus::Paused;
    }

    pub fn mark_stopped(&mut self) {
        self.status = MirrorStatus::Stopped;
    }

    /// Apply a pushed snapshot.
    ///
    /// A snapshot served from the replay cache that is not the first of the
    /// session is a replay: discarded under [`ReplayPolicy::Discard`], and
    /// under [`ReplayPolicy::DiffAndApply`] applied only when it differs
    /// from the current documents. Everything else is applied: counters
    /// move, and documents and index are replaced together.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot, policy: ReplayPolicy) -> SnapshotOutcome {
        let is_replay = snapshot.from_cache && self.snapshots_since_start > 0;
        if is_replay && policy == ReplayPolicy::Discard {
            return SnapshotOutcome::IgnoredReplay;
        }

        let deltas = compute_deltas(&self.documents, &snapshot.documents);
        if is_replay && deltas.is_empty() {
            return SnapshotOutcome::IgnoredReplay;
        }

        self.snapshots_since_start += 1;
        self.snapshot_count += 1;
        self.delta_count += deltas.len() as u64;
        self.documents = snapshot.documents.clone();
        self.by_key = build_index(&self.documents);
        self.last_update = Some(Utc::now());

        SnapshotOutcome::Applied(deltas)
    }

    /// Every document is reachable through its normalized id and the index
    /// holds nothing else. With colliding normalized ids the last document
    /// wins.
    pub fn index_is_consistent(&self) -> bool {
        let keys: HashSet<String> = self.documents.iter().map(|d| normalize_key(&d.id)).collect();
        if keys.len() != self.by_key.len() {
            return false;
        }
        self.by_key.iter().all(|(key, &i)| {
            let Some(doc) = self.documents.get(i) else {
                return false;
            };
            let later_duplicate = self.documents[i + 1..]
                .iter()
                .any(|d| normalize_key(&d.id) == *key);
            normalize_key(&doc.id) == *key && !later_duplicate
        })
    }
}

fn build_index(documents: &[Document]) -> HashMap<String, usize> {
    documents
        .iter()
        .enumerate()
        .map(|(i, doc)| (normalize_key(&doc.id), i))
        .collect()
}

/// Deltas from `old` to `new`: additions and modifications in `new` order,
/// then removals in `old` order.
fn compute_deltas(old: &[Document], new: &[Document]) -> Vec<DeltaEvent> {
    let previous: HashMap<&str, &Document> = old.iter().map(|d| (d.id.as_str(), d)).collect();
    let current: HashSet<&str> = new.iter().map(|d| d.id.as_str()).collect();

    let mut deltas = Vec::new();
    for doc in new {
        let kind = match previous.get(doc.id.as_str()) {
            None => ChangeKind::Added,
            Some(prev) if prev.fields != doc.fields => ChangeKind::Modified,
            Some(_) => continue,
        };
        deltas.push(DeltaEvent {
            kind,
            doc_id: doc.id.clone(),
            doc: Some(doc.clone()),
        });
    }
    for doc in old {
        if !current.contains(doc.id.as_str()) {
            deltas.push(DeltaEvent {
                kind: ChangeKind::Removed,
                doc_id: doc.id.clone(),
                doc: None,
            });
        }
    }
    deltas
}

type MirrorCallback = Arc<dyn Fn(&[Document], &[DeltaEvent]) -> ListenerResult + Send + Sync>;

/// Counters reported by [`LiveMirror::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct MirrorStats {
    pub collection: String,
    pub status: MirrorStatus,
    pub documents: usize,
    pub snapshots: u64,
    pub deltas: u64,
    pub subscribers: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub avg_deltas_per_snapshot: f64,
}

#[derive(Default)]
struct Runtime {
    /// Bumped by every start, stop and pause. Work tagged with an older
    /// session is dropped.
    session: u64,
    cancel: Option<CancelHandle>,
    pump: Option<AbortHandle>,
    restart: Option<AbortHandle>,
}

impl Runtime {
    /// Detach everything tied to the current session.
    fn teardown(&mut self) -> Option<CancelHandle> {
        self.session += 1;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(restart) = self.restart.take() {
            restart.abort();
        }
        self.cancel.take()
    }
}

/// Handle returned by [`LiveMirror::subscribe`].
#[derive(Debug, Clone)]
pub struct MirrorSubscription {
    mirror: Weak<LiveMirror>,
    id: u64,
}

impl MirrorSubscription {
    pub fn unsubscribe(&self) -> bool {
        match self.mirror.upgrade() {
            Some(mirror) => {
                let mut subscribers = lock(&mirror.subscribers);
                let before = subscribers.len();
                subscribers.retain(|(id, _)| *id != self.id);
                subscribers.len() != before
            }
            None => false,
        }
    }
}

/// Live in-memory copy of one collection.
pub struct LiveMirror {
    collection: String,
    store: Arc<dyn RemoteStore>,
    bus: EventBus,
    restart_delay: Duration,
    replay_policy: ReplayPolicy,
    // Lock order: runtime before state.
    runtime: Mutex<Runtime>,
    state: Mutex<MirrorState>,
    subscribers: Mutex<Vec<(u64, MirrorCallback)>>,
    next_subscriber: AtomicU64,
}

impl std::fmt::Debug for LiveMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveMirror")
            .field("collection", &self.collection)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Builder for [`LiveMirror`].
pub struct LiveMirrorBuilder {
    collection: String,
    store: Arc<dyn RemoteStore>,
    bus: EventBus,
    restart_delay: Duration,
    replay_policy: ReplayPolicy,
}

impl LiveMirrorBuilder {
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn replay_policy(mut self, policy: ReplayPolicy) -> Self {
        self.replay_policy = policy;
        self
    }

    pub fn build(self) -> Arc<LiveMirror> {
        Arc::new(LiveMirror {
            collection: self.collection,
            store: self.store,
            bus: self.bus,
            restart_delay: self.restart_delay,
            replay_policy: self.replay_policy,
            runtime: Mutex::new(Runtime::default()),
            state: Mutex::new(MirrorState::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
        })
    }
}

impl LiveMirror {
    pub fn builder(
        collection: impl Into<String>,
        store: Arc<dyn RemoteStore>,
        bus: EventBus,
    ) -> LiveMirrorBuilder {
        let defaults = SyncConfig::default();
        LiveMirrorBuilder {
            collection: collection.into(),
            store,
            bus,
            restart_delay: defaults.mirror_restart_delay(),
            replay_policy: defaults.replay_policy,
        }
    }

    /// Mirror of `config.mirror_collection` with the configured restart
    /// delay and replay policy.
    pub fn from_config(
        store: Arc<dyn RemoteStore>,
        bus: EventBus,
        config: &SyncConfig,
    ) -> Arc<Self> {
        Self::builder(config.mirror_collection.as_str(), store, bus)
            .restart_delay(config.mirror_restart_delay())
            .replay_policy(config.replay_policy)
            .build()
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Open the push subscription. No-op while starting or active.
    ///
    /// Failures are logged and schedule one restart after the restart
    /// delay; they never reach the caller.
    pub async fn start(self: &Arc<Self>) {
        let session = {
            let mut runtime = lock(&self.runtime);
            let mut state = lock(&self.state);
            if matches!(state.status(), MirrorStatus::Starting | MirrorStatus::Active) {
                return;
            }
            if let Some(restart) = runtime.restart.take() {
                restart.abort();
            }
            runtime.session += 1;
            state.begin_session();
            runtime.session
        };

        info!(collection = %self.collection, "starting live mirror");
        let Listener { snapshots, cancel } =
            match self.store.listen(&self.collection, &QueryFilters::new()).await {
                Ok(listener) => listener,
                Err(source) => {
                    self.handle_failure(session, source);
                    return;
                }
            };

        let mut runtime = lock(&self.runtime);
        if runtime.session != session {
            // Stopped or paused while the listener was opening
            drop(runtime);
            cancel.cancel();
            return;
        }
        lock(&self.state).activate();
        runtime.cancel = Some(cancel);
        let task = tokio::spawn(pump(Arc::downgrade(self), session, snapshots));
        runtime.pump = Some(task.abort_handle());
    }

    /// Cancel the subscription. Idempotent; leaves the mirror un-paused.
    pub fn stop(&self) {
        let cancel = {
            let mut runtime = lock(&self.runtime);
            let cancel = runtime.teardown();
            lock(&self.state).mark_stopped();
            cancel
        };
        if let Some(cancel) = cancel {
            info!(collection = %self.collection, "live mirror stopped");
            cancel.cancel();
        }
    }

    /// Cancel the subscription and mark the mirror paused. Data already
    /// mirrored stays readable.
    pub fn pause(&self) {
        let cancel = {
            let mut runtime = lock(&self.runtime);
            let mut state = lock(&self.state);
            if state.status() == MirrorStatus::Paused {
                return;
            }
            let cancel = runtime.teardown();
            state.mark_paused();
            cancel
        };
        debug!(collection = %self.collection, "live mirror paused");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// Clear the paused flag and start again.
    pub async fn resume(self: &Arc<Self>) {
        debug!(collection = %self.collection, "live mirror resuming");
        self.start().await;
    }

    pub async fn set_visibility(self: &Arc<Self>, visibility: Visibility) {
        match visibility {
            Visibility::Hidden => self.pause(),
            Visibility::Visible => self.resume().await,
        }
    }

    fn session_is(&self, session: u64) -> bool {
        lock(&self.runtime).session == session
    }

    fn on_snapshot(&self, session: u64, snapshot: &Snapshot) {
        let (documents, deltas) = {
            let runtime = lock(&self.runtime);
            if runtime.session != session {
                return;
            }
            let mut state = lock(&self.state);
            if state.status() != MirrorStatus::Active {
                return;
            }
            match state.apply_snapshot(snapshot, self.replay_policy) {
                SnapshotOutcome::IgnoredReplay => {
                    debug!(collection = %self.collection, "ignoring replayed snapshot");
                    return;
                }
                SnapshotOutcome::Applied(deltas) => (state.documents().to_vec(), deltas),
            }
        };

        trace!(
            collection = %self.collection,
            documents = documents.len(),
            deltas = deltas.len(),
            "snapshot applied"
        );

        self.bus.emit(
            &format!("{}:updated", self.collection),
            json!({
                "data": documents_to_value(&documents),
                "changes": serde_json::to_value(&deltas).unwrap_or_default(),
            }),
        );

        let subscribers: Vec<MirrorCallback> = lock(&self.subscribers)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in subscribers {
            if !self.session_is(session) {
                return;
            }
            if let Err(failure) = invoke_listener(|| callback(&documents, &deltas)) {
                error!(collection = %self.collection, error = %failure, "mirror subscriber failed");
            }
        }
    }

    /// Log the failure, mark the mirror stopped and schedule one restart.
    fn handle_failure(self: &Arc<Self>, session: u64, source: StoreError) {
        let cancel = {
            let mut runtime = lock(&self.runtime);
            if runtime.session != session {
                return;
            }
            let err = SyncError::Subscription {
                collection: self.collection.clone(),
                source,
            };
            error!(
                collection = %self.collection,
                error = %err,
                retry_in_secs = self.restart_delay.as_secs(),
                "mirror subscription failed"
            );
            lock(&self.state).mark_stopped();
            // The pump is the caller or already finished
            runtime.pump = None;

            let mirror = Arc::downgrade(self);
            let delay = self.restart_delay;
            let restart = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(mirror) = mirror.upgrade() {
                    mirror.restart(session).await;
                }
            });
            runtime.restart = Some(restart.abort_handle());
            runtime.cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// Restart scheduled by `handle_failure`. Skipped if the mirror was
    /// stopped, paused or restarted since.
    async fn restart(self: &Arc<Self>, failed_session: u64) {
        {
            let mut runtime = lock(&self.runtime);
            if runtime.session != failed_session
                || lock(&self.state).status() != MirrorStatus::Stopped
            {
                return;
            }
            runtime.restart = None;
        }
        info!(collection = %self.collection, "restarting live mirror");
        self.start().await;
    }

    /// Current documents. Never touches the remote store.
    pub fn get_data(&self) -> Vec<Document> {
        lock(&self.state).documents().to_vec()
    }

    /// O(1) lookup by machine key, normalized the same way as the index.
    pub fn get_for_machine(&self, key: &str) -> Option<Document> {
        lock(&self.state).get(key).cloned()
    }

    pub fn has_data(&self) -> bool {
        lock(&self.state).has_data()
    }

    /// True while the subscription is open or opening.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status(),
            MirrorStatus::Starting | MirrorStatus::Active
        )
    }

    pub fn is_paused(&self) -> bool {
        self.status() == MirrorStatus::Paused
    }

    pub fn status(&self) -> MirrorStatus {
        lock(&self.state).status()
    }

    /// Copy of the full mirror state.
    pub fn state(&self) -> MirrorState {
        lock(&self.state).clone()
    }

    /// Register `callback` for future updates. If a snapshot has already
    /// been applied it fires immediately with the current documents and no
    /// deltas.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> MirrorSubscription
    where
        F: Fn(&[Document], &[DeltaEvent]) -> ListenerResult + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let callback: MirrorCallback = Arc::new(callback);
        lock(&self.subscribers).push((id, Arc::clone(&callback)));

        let current = {
            let state = lock(&self.state);
            state.has_data().then(|| state.documents().to_vec())
        };
        if let Some(documents) = current
            && let Err(failure) = invoke_listener(|| callback(&documents, &[]))
        {
            error!(collection = %self.collection, error = %failure, "mirror subscriber failed");
        }

        MirrorSubscription {
            mirror: Arc::downgrade(self),
            id,
        }
    }

    pub fn stats(&self) -> MirrorStats {
        let state = lock(&self.state);
        // The initial load is not an update
        let avg_deltas_per_snapshot = if state.snapshot_count() > 1 {
            state.delta_count() as f64 / (state.snapshot_count() - 1) as f64
        } else {
            0.0
        };
        MirrorStats {
            collection: self.collection.clone(),
            status: state.status(),
            documents: state.documents().len(),
            snapshots: state.snapshot_count(),
            deltas: state.delta_count(),
            subscribers: lock(&self.subscribers).len(),
            last_update: state.last_update(),
            avg_deltas_per_snapshot,
        }
    }
}

impl Drop for LiveMirror {
    fn drop(&mut self) {
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(cancel) = runtime.teardown() {
            cancel.cancel();
        }
    }
}

/// Forward snapshots from the listener to the mirror until the stream
/// fails or the mirror goes away.
async fn pump(
    mirror: Weak<LiveMirror>,
    session: u64,
    mut snapshots: mpsc::UnboundedReceiver<Result<Snapshot, StoreError>>,
) {
    loop {
        let item = snapshots.recv().await;
        let Some(mirror) = mirror.upgrade() else {
            return;
        };
        match item {
            Some(Ok(snapshot)) => mirror.on_snapshot(session, &snapshot),
            Some(Err(source)) => {
                mirror.handle_failure(session, source);
                return;
            }
            None => {
                mirror.handle_failure(session, StoreError::Cancelled);
                return;
            }
        }
    }
}

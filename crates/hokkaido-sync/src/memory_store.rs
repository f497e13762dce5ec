//! In-memory remote store.
//!
//! Behaves like the hosted document store closely enough to drive the whole
//! subsystem: server timestamps, generated ids, query evaluation, a batch
//! size limit and push listeners that receive an initial snapshot followed
//! by one snapshot per mutation that changes their result set. Faults can
//! be injected for reads, writes, batch commits and listeners.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::lock;
use crate::remote::{
    CancelHandle, ChangeKind, DEFAULT_MAX_BATCH_SIZE, DocumentChange, Listener, RemoteStore,
    Snapshot, StoreError,
};
use crate::types::{Direction, Document, Fields, FilterOp, QueryFilters, WhereClause};

type SnapshotSender = mpsc::UnboundedSender<Result<Snapshot, StoreError>>;

struct ListenerSlot {
    id: u64,
    collection: String,
    filters: QueryFilters,
    /// Result set last delivered to this listener.
    last: Vec<Document>,
    tx: SnapshotSender,
}

#[derive(Default)]
struct StoreData {
    collections: HashMap<String, BTreeMap<String, Fields>>,
    listeners: Vec<ListenerSlot>,
    next_listener: u64,
}

impl StoreData {
    fn query(&self, collection: &str, filters: &QueryFilters) -> Vec<Document> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        run_query(docs, filters)
    }

    /// Push a snapshot to every listener on `collection` whose result set
    /// changed. Listeners whose receiver is gone are dropped.
    fn notify(&mut self, collection: &str) {
        let docs = self.collections.get(collection).cloned().unwrap_or_default();
        self.listeners.retain_mut(|slot| {
            if slot.collection != collection {
                return true;
            }
            let documents = run_query(&docs, &slot.filters);
            let changes = diff(&slot.last, &documents);
            if changes.is_empty() {
                return true;
            }
            slot.last = documents.clone();
            trace!(collection = %collection, listener = slot.id, changes = changes.len(), "pushing snapshot");
            slot.tx
                .send(Ok(Snapshot {
                    documents,
                    changes,
                    from_cache: false,
                }))
                .is_ok()
        });
    }
}

/// Remote store held entirely in memory.
pub struct MemoryStore {
    data: Arc<Mutex<StoreData>>,
    max_batch_size: usize,
    fail_reads: AtomicUsize,
    fail_writes: AtomicUsize,
    /// Number of batch commits that succeed before the next one fails.
    fail_batch_after: Mutex<Option<usize>>,
    reads: AtomicU64,
    writes: AtomicU64,
    batch_commits: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_batch_size(DEFAULT_MAX_BATCH_SIZE)
    }

    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(StoreData::default())),
            max_batch_size,
            fail_reads: AtomicUsize::new(0),
            fail_writes: AtomicUsize::new(0),
            fail_batch_after: Mutex::new(None),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            batch_commits: AtomicU64::new(0),
        }
    }

    /// Insert or replace documents as-is (no timestamps) and notify
    /// listeners.
    pub fn seed(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
        let mut data = lock(&self.data);
        let entries = data.collections.entry(collection.to_string()).or_default();
        for doc in documents {
            entries.insert(doc.id, doc.fields);
        }
        data.notify(collection);
    }

    /// Remove a document without counting it as a client write.
    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let mut data = lock(&self.data);
        let removed = data
            .collections
            .get_mut(collection)
            .is_some_and(|docs| docs.remove(id).is_some());
        if removed {
            data.notify(collection);
        }
        removed
    }

    pub fn document_count(&self, collection: &str) -> usize {
        lock(&self.data)
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Number of open listeners on `collection`.
    pub fn listener_count(&self, collection: &str) -> usize {
        lock(&self.data)
            .listeners
            .iter()
            .filter(|slot| slot.collection == collection && !slot.tx.is_closed())
            .count()
    }

    /// Re-deliver each listener's last result set flagged as served from
    /// the local cache, as a client does after reconnecting.
    pub fn replay_to_listeners(&self, collection: &str) {
        let data = lock(&self.data);
        for slot in data.listeners.iter().filter(|s| s.collection == collection) {
            let _ = slot.tx.send(Ok(Snapshot {
                documents: slot.last.clone(),
                changes: Vec::new(),
                from_cache: true,
            }));
        }
    }

    /// Deliver an arbitrary snapshot to every listener on `collection`.
    pub fn inject_snapshot(&self, collection: &str, snapshot: Snapshot) {
        let data = lock(&self.data);
        for slot in data.listeners.iter().filter(|s| s.collection == collection) {
            let _ = slot.tx.send(Ok(snapshot.clone()));
        }
    }

    /// Kill every listener on `collection` with `error`.
    pub fn fail_listeners(&self, collection: &str, error: StoreError) {
        let mut data = lock(&self.data);
        data.listeners.retain(|slot| {
            if slot.collection != collection {
                return true;
            }
            let _ = slot.tx.send(Err(error.clone()));
            false
        });
    }

    /// Fail the next `n` queries and single-document reads.
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` single-document writes.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Let `n` batch commits succeed, then fail the next one.
    pub fn fail_batch_after(&self, n: usize) {
        *lock(&self.fail_batch_after) = Some(n);
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn batch_commit_count(&self) -> u64 {
        self.batch_commits.load(Ordering::SeqCst)
    }

    fn check_read(&self) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if take_fault(&self.fail_reads) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if take_fault(&self.fail_writes) {
            return Err(StoreError::Unavailable(
                "injected write failure".to_string(),
            ));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_batch(&self) -> Result<(), StoreError> {
        let mut remaining = lock(&self.fail_batch_after);
        match remaining.as_mut() {
            Some(0) => {
                *remaining = None;
                Err(StoreError::Unavailable(
                    "injected batch failure".to_string(),
                ))
            }
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Decrement `counter` if positive, returning whether a fault fired.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn server_timestamp() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn query(
        &self,
        collection: &str,
        filters: &QueryFilters,
    ) -> Result<Vec<Document>, StoreError> {
        self.check_read()?;
        Ok(lock(&self.data).query(collection, filters))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check_read()?;
        let data = lock(&self.data);
        Ok(data
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document::new(id, fields.clone())))
    }

    async fn create(
        &self,
        collection: &str,
        mut fields: Fields,
        stamp_field: &str,
    ) -> Result<String, StoreError> {
        self.check_write()?;
        let id = Uuid::new_v4().simple().to_string();
        fields.insert(stamp_field.to_string(), server_timestamp());

        let mut data = lock(&self.data);
        data.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);
        data.notify(collection);
        Ok(id)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        stamp_field: &str,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let mut data = lock(&self.data);
        let existing = data
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        existing.extend(fields);
        existing.insert(stamp_field.to_string(), server_timestamp());
        data.notify(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check_write()?;
        let mut data = lock(&self.data);
        let removed = data
            .collections
            .get_mut(collection)
            .is_some_and(|docs| docs.remove(id).is_some());
        if removed {
            data.notify(collection);
        }
        Ok(())
    }

    async fn commit_batch_delete(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<(), StoreError> {
        if ids.len() > self.max_batch_size {
            return Err(StoreError::Rejected(format!(
                "batch of {} exceeds limit {}",
                ids.len(),
                self.max_batch_size
            )));
        }
        self.check_batch()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.batch_commits.fetch_add(1, Ordering::SeqCst);

        let mut data = lock(&self.data);
        if let Some(docs) = data.collections.get_mut(collection) {
            for id in ids {
                docs.remove(id);
            }
        }
        data.notify(collection);
        Ok(())
    }

    async fn listen(
        &self,
        collection: &str,
        filters: &QueryFilters,
    ) -> Result<Listener, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut data = lock(&self.data);

        let documents = data.query(collection, filters);
        let changes = documents
            .iter()
            .map(|doc| DocumentChange {
                kind: ChangeKind::Added,
                document: doc.clone(),
            })
            .collect();
        // The receiver is still in hand, so the initial send cannot fail.
        let _ = tx.send(Ok(Snapshot {
            documents: documents.clone(),
            changes,
            from_cache: false,
        }));

        let id = data.next_listener;
        data.next_listener += 1;
        data.listeners.push(ListenerSlot {
            id,
            collection: collection.to_string(),
            filters: filters.clone(),
            last: documents,
            tx,
        });

        let weak: Weak<Mutex<StoreData>> = Arc::downgrade(&self.data);
        let cancel = CancelHandle::new(move || {
            if let Some(data) = weak.upgrade() {
                lock(&data).listeners.retain(|slot| slot.id != id);
            }
        });

        Ok(Listener {
            snapshots: rx,
            cancel,
        })
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

fn run_query(docs: &BTreeMap<String, Fields>, filters: &QueryFilters) -> Vec<Document> {
    let mut matched: Vec<Document> = docs
        .iter()
        .filter(|(_, fields)| filters.where_clauses.iter().all(|c| clause_matches(fields, c)))
        .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
        .collect();

    if let Some(order) = &filters.order_by {
        matched.sort_by(|a, b| {
            let ord = compare_opt(a.get(&order.field), b.get(&order.field));
            match order.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            }
        });
    }

    if let Some(limit) = filters.limit {
        matched.truncate(limit);
    }
    matched
}

/// Missing fields never match a clause.
fn clause_matches(fields: &Fields, clause: &WhereClause) -> bool {
    let Some(actual) = fields.get(&clause.field) else {
        return false;
    };
    match clause.op {
        FilterOp::Eq => values_equal(actual, &clause.value),
        FilterOp::Ne => !values_equal(actual, &clause.value),
        FilterOp::Lt => compare(actual, &clause.value) == Some(CmpOrdering::Less),
        FilterOp::Le => matches!(
            compare(actual, &clause.value),
            Some(CmpOrdering::Less | CmpOrdering::Equal)
        ),
        FilterOp::Gt => compare(actual, &clause.value) == Some(CmpOrdering::Greater),
        FilterOp::Ge => matches!(
            compare(actual, &clause.value),
            Some(CmpOrdering::Greater | CmpOrdering::Equal)
        ),
        FilterOp::In => clause
            .value
            .as_array()
            .is_some_and(|options| options.iter().any(|v| values_equal(actual, v))),
        FilterOp::ArrayContains => actual
            .as_array()
            .is_some_and(|items| items.iter().any(|v| values_equal(v, &clause.value))),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Order two scalar values of the same type. Mixed types do not compare.
fn compare(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Sort order for `order_by`: missing values first, incomparable values
/// keep their relative order.
fn compare_opt(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (None, None) => CmpOrdering::Equal,
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (Some(x), Some(y)) => compare(x, y).unwrap_or(CmpOrdering::Equal),
    }
}

/// Changes between two result sets: additions and modifications in the
/// order of `new`, then removals in the order of `old`.
fn diff(old: &[Document], new: &[Document]) -> Vec<DocumentChange> {
    let previous: HashMap<&str, &Document> = old.iter().map(|d| (d.id.as_str(), d)).collect();
    let current: HashMap<&str, &Document> = new.iter().map(|d| (d.id.as_str(), d)).collect();

    let mut changes = Vec::new();
    for doc in new {
        let kind = match previous.get(doc.id.as_str()) {
            None => ChangeKind::Added,
            Some(prev) if prev.fields != doc.fields => ChangeKind::Modified,
            Some(_) => continue,
        };
        changes.push(DocumentChange {
            kind,
            document: doc.clone(),
        });
    }
    for doc in old {
        if !current.contains_key(doc.id.as_str()) {
            changes.push(DocumentChange {
                kind: ChangeKind::Removed,
                document: doc.clone(),
            });
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(id: &str, value: Value) -> Document {
        Document::new(id, value.as_object().cloned().unwrap_or_default())
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.id.as_str()).collect()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed(
            "production_entries",
            [
                doc("e1", json!({"machine": "H01", "qty": 40, "date": "2026-02-19"})),
                doc("e2", json!({"machine": "H02", "qty": 10, "date": "2026-02-20"})),
                doc("e3", json!({"machine": "H01", "qty": 25, "date": "2026-02-20"})),
            ],
        );
        store
    }

    #[tokio::test]
    async fn test_query_where_order_limit() {
        let store = seeded();
        let filters = QueryFilters::new()
            .where_eq("date", json!("2026-02-20"))
            .order_by("qty", Direction::Desc)
            .limit(1);

        let docs = store.query("production_entries", &filters).await.unwrap();
        assert_eq!(ids(&docs), vec!["e3"]);

        let all = store
            .query("production_entries", &QueryFilters::new())
            .await
            .unwrap();
        assert_eq!(ids(&all), vec!["e1", "e2", "e3"]);

        let ranged = QueryFilters::new()
            .filter("qty", FilterOp::Ge, json!(25))
            .filter("machine", FilterOp::In, json!(["H01", "H09"]));
        let docs = store.query("production_entries", &ranged).await.unwrap();
        assert_eq!(ids(&docs), vec!["e1", "e3"]);
    }

    #[tokio::test]
    async fn test_create_update_stamp_server_time() {
        let store = MemoryStore::new();
        let id = store
            .create("planning", doc("", json!({"machine": "H03"})).fields, "createdAt")
            .await
            .unwrap();
        assert_eq!(id.len(), 32);

        store
            .update("planning", &id, doc("", json!({"qty": 5})).fields, "updatedAt")
            .await
            .unwrap();
        let stored = store.get("planning", &id).await.unwrap().unwrap();
        assert_eq!(stored.get("machine"), Some(&json!("H03")));
        assert_eq!(stored.get("qty"), Some(&json!(5)));
        assert!(stored.get("createdAt").is_some_and(Value::is_string));
        assert!(stored.get("updatedAt").is_some_and(Value::is_string));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found_delete_missing_is_ok() {
        let store = MemoryStore::new();
        let err = store
            .update("planning", "nope", Fields::new(), "updatedAt")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.delete("planning", "nope").await.is_ok());
    }

    #[tokio::test]
    async fn test_listener_gets_initial_then_deltas() {
        let store = seeded();
        let mut listener = store
            .listen("production_entries", &QueryFilters::new().where_eq("machine", json!("H01")))
            .await
            .unwrap();

        let initial = listener.snapshots.recv().await.unwrap().unwrap();
        assert_eq!(ids(&initial.documents), vec!["e1", "e3"]);
        assert!(initial.changes.iter().all(|c| c.kind == ChangeKind::Added));

        // Outside the listened query, no push
        store.seed("production_entries", [doc("e4", json!({"machine": "H07"}))]);
        store.delete("production_entries", "e1").await.unwrap();

        let next = listener.snapshots.recv().await.unwrap().unwrap();
        assert_eq!(ids(&next.documents), vec!["e3"]);
        assert_eq!(next.changes.len(), 1);
        assert_eq!(next.changes[0].kind, ChangeKind::Removed);
        assert!(listener.snapshots.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_closes_stream() {
        let store = seeded();
        let Listener {
            mut snapshots,
            cancel,
        } = store
            .listen("production_entries", &QueryFilters::new())
            .await
            .unwrap();
        assert_eq!(store.listener_count("production_entries"), 1);

        cancel.cancel();
        assert_eq!(store.listener_count("production_entries"), 0);
        assert!(snapshots.recv().await.is_some());
        assert!(snapshots.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_batch_limit_and_injected_failure() {
        let store = MemoryStore::with_max_batch_size(2);
        let too_many: Vec<String> = ["a", "b", "c"].map(String::from).to_vec();
        assert!(matches!(
            store.commit_batch_delete("planning", &too_many).await,
            Err(StoreError::Rejected(_))
        ));

        store.fail_batch_after(1);
        assert!(store.commit_batch_delete("planning", &too_many[..2]).await.is_ok());
        assert!(store.commit_batch_delete("planning", &too_many[2..]).await.is_err());
        assert!(store.commit_batch_delete("planning", &too_many[2..]).await.is_ok());
        assert_eq!(store.batch_commit_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_read_failures_are_counted_down() {
        let store = seeded();
        store.fail_next_reads(1);
        assert!(store.query("production_entries", &QueryFilters::new()).await.is_err());
        assert!(store.query("production_entries", &QueryFilters::new()).await.is_ok());
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn test_replay_is_flagged_from_cache() {
        let store = seeded();
        let mut listener = store
            .listen("production_entries", &QueryFilters::new())
            .await
            .unwrap();
        let _ = listener.snapshots.recv().await;

        store.replay_to_listeners("production_entries");
        let replay = listener.snapshots.recv().await.unwrap().unwrap();
        assert!(replay.from_cache);
        assert_eq!(replay.documents.len(), 3);

        store.fail_listeners("production_entries", StoreError::Cancelled);
        assert_eq!(
            listener.snapshots.recv().await,
            Some(Err(StoreError::Cancelled))
        );
        assert!(listener.snapshots.recv().await.is_none());
    }
}

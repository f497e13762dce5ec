//! The remote document store as seen by the sync core.
//!
//! Only four capabilities are consumed: collection queries, single-document
//! reads, writes (including committed batch deletes) and push
//! subscriptions. Timeouts and retries are the implementation's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Document, Fields, QueryFilters};

/// Largest batch the reference store commits in one go.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Field stamped with the server time on create.
pub const CREATED_AT_FIELD: &str = "createdAt";

/// Field stamped with the server time on update.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Errors reported by a remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Target document does not exist.
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Store unreachable or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Listener was cancelled by the store.
    #[error("listener cancelled")]
    Cancelled,
}

/// Kind of a per-document change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// A document change reported alongside a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// Full result set of a listened query after a server-side mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub documents: Vec<Document>,
    pub changes: Vec<DocumentChange>,
    /// Served from the client-side replay cache (e.g. on reconnect) rather
    /// than fresh from the server.
    pub from_cache: bool,
}

/// Cancels a remote listener. Cancelling twice is harmless.
pub struct CancelHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// An open push subscription.
///
/// The receiver yields one item per server-side mutation (the first item is
/// the initial result set). An `Err` item means the listener is dead and no
/// more items follow.
#[derive(Debug)]
pub struct Listener {
    pub snapshots: mpsc::UnboundedReceiver<Result<Snapshot, StoreError>>,
    pub cancel: CancelHandle,
}

/// Capabilities the sync core needs from the remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Run a query and return the matching documents.
    async fn query(&self, collection: &str, filters: &QueryFilters)
    -> Result<Vec<Document>, StoreError>;

    /// Read a single document.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Create a document with a generated id. `stamp_field` is set to the
    /// server write time.
    async fn create(
        &self,
        collection: &str,
        fields: Fields,
        stamp_field: &str,
    ) -> Result<String, StoreError>;

    /// Merge `fields` into an existing document and stamp `stamp_field`.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        stamp_field: &str,
    ) -> Result<(), StoreError>;

    /// Delete a document. Deleting an absent document succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Delete `ids` atomically in one committed batch.
    async fn commit_batch_delete(&self, collection: &str, ids: &[String])
    -> Result<(), StoreError>;

    /// Open a push subscription on a query.
    async fn listen(&self, collection: &str, filters: &QueryFilters)
    -> Result<Listener, StoreError>;

    /// Maximum number of operations in one committed batch.
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }
}

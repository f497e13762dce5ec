//! Error types for the sync core.

use std::ops::Range;

use thiserror::Error;

use crate::remote::StoreError;

/// Errors surfaced to callers of repositories, mirrors and the router.
///
/// Every variant that wraps a remote failure carries the collection name so
/// callers can decide on their own fail-soft policy.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A query or single-document read against the remote store failed.
    #[error("remote read on {collection} failed: {source}")]
    RemoteRead {
        collection: String,
        #[source]
        source: StoreError,
    },

    /// A create/update/delete against the remote store failed.
    #[error("remote write on {collection} failed: {source}")]
    RemoteWrite {
        collection: String,
        #[source]
        source: StoreError,
    },

    /// A committed batch in a chunked delete failed. Chunks after this one
    /// were not attempted.
    #[error(
        "batch delete on {collection} failed at chunk {chunk}; ids {}..{} not processed: {source}",
        .unprocessed.start,
        .unprocessed.end
    )]
    BatchChunk {
        collection: String,
        /// Zero-based index of the failing chunk.
        chunk: usize,
        /// Indices into the caller's id slice that were not deleted.
        unprocessed: Range<usize>,
        #[source]
        source: StoreError,
    },

    /// Opening or keeping a push subscription failed.
    #[error("subscription on {collection} failed: {source}")]
    Subscription {
        collection: String,
        #[source]
        source: StoreError,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// The collection involved, if any.
    pub fn collection(&self) -> Option<&str> {
        match self {
            SyncError::RemoteRead { collection, .. }
            | SyncError::RemoteWrite { collection, .. }
            | SyncError::BatchChunk { collection, .. }
            | SyncError::Subscription { collection, .. } => Some(collection),
            SyncError::Config(_) => None,
        }
    }
}

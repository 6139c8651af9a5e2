//! Error types for the cache synchronization layer.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the synchronization layer.
///
/// Every variant is cloneable so a single failure can be fanned out to all
/// callers deduplicated onto one in-flight fetch.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Network or remote error from a fetcher/operation. Retryable.
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Bad payload rejected by the remote or by the operation itself. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The rollback of an optimistic update could not be applied. The affected
    /// key must be invalidated since its cached state is no longer trustworthy.
    #[error("Rollback failed for key {key}: {reason}")]
    Rollback { key: String, reason: String },

    /// The sync queue exceeded its configured bound.
    #[error("Sync queue overflow: {dropped} pending item(s) dropped")]
    QueueOverflow { dropped: usize },

    /// Bounded retry gave up.
    #[error("Retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SyncError>,
    },

    /// Malformed cache key or pattern.
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// Operation attempted after the client was shut down.
    #[error("Sync client is shut down")]
    Closed,
}

impl SyncError {
    /// Build a retryable fetch error from any displayable cause.
    pub fn fetch(cause: impl std::fmt::Display) -> Self {
        SyncError::Fetch(cause.to_string())
    }

    /// Whether the retry machinery may attempt this operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Fetch(_))
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Fetch(format!("{err:#}"))
    }
}

//! Error types for store access.

use thiserror::Error;

/// Errors that can occur when reading from or writing to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or returned a server-side failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the request because of provisioned throughput.
    #[error("store throttled: {0}")]
    Throttled(String),

    /// A record is missing its primary key or is otherwise malformed.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The request itself is malformed (bad condition, unknown index, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A batch write exceeded the store's per-call limit.
    #[error("batch of {size} writes exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other backend failure that is not worth retrying.
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether repeating the same call may succeed.
    ///
    /// Reads are always safe to repeat with the same cursor, and writes are
    /// idempotent upserts or deletes by key, so both may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Throttled(_))
    }
}

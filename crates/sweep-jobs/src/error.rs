//! Error types for job execution.

use sweep_store::StoreError;
use thiserror::Error;

use crate::checkpoint::Checkpoint;

/// Errors that stop a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Reading the job's source failed after retries. `checkpoint` is the
    /// last consistent progress and can seed a resumed run.
    #[error("job aborted: {source}")]
    Aborted {
        #[source]
        source: StoreError,
        checkpoint: Option<Box<Checkpoint>>,
    },

    /// A supplied checkpoint belongs to another job or run mode.
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Loading or saving a checkpoint failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobError {
    /// The checkpoint to resume from, if the error carries one.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            JobError::Aborted { checkpoint, .. } => checkpoint.as_deref(),
            _ => None,
        }
    }
}

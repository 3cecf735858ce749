//! Error taxonomy for the finspect core
//!
//! Every operation in the core returns [`CoreError`]. The kinds map one-to-one onto the
//! outcomes the API layer exposes, see [`CoreError::status_code`].

use std::path::PathBuf;
use thiserror::Error;

use crate::jobs::{JobId, JobState};
use crate::watcher::WatchPathId;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A non-terminal job already exists for the same (kind, target key)
    #[error("conflict: job {existing} is already in flight for this target")]
    Conflict { existing: JobId },

    #[error("path is already watched by {existing}")]
    AlreadyWatched { existing: WatchPathId },

    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("invalid transition for job {job}: {from} -> {to}")]
    InvalidTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("job {0} is still active and cannot be deleted")]
    StillActive(JobId),

    #[error("job {job} reached its retry limit ({max_retries})")]
    RetryLimitExceeded { job: JobId, max_retries: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage failure: {0}")]
    StorageFailure(#[from] rusqlite::Error),

    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP status the API layer should answer with for this error
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::NotFound { .. } | CoreError::PathNotFound(_) => 404,
            CoreError::Conflict { .. }
            | CoreError::AlreadyWatched { .. }
            | CoreError::InvalidTransition { .. }
            | CoreError::StillActive(_)
            | CoreError::RetryLimitExceeded { .. } => 409,
            CoreError::InvalidInput(_) => 400,
            CoreError::StorageFailure(_) | CoreError::Io(_) => 503,
            CoreError::Serialization(_) | CoreError::Watcher(_) => 500,
        }
    }

    /// Only storage failures threaten the event log, everything else is recoverable
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::StorageFailure(_) | CoreError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

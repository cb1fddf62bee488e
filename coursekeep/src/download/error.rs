//! Errors returned by download manager operations.
//!
//! Failures of the transfer itself are not errors of the API call: they are
//! captured on the job as a [`super::JobFailure`] and surfaced through
//! events.

use thiserror::Error;

use super::job::JobId;
use super::state::DownloadStatus;
use crate::persistence::StoreError;

/// Rejections of download manager operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No job with this id is known.
    #[error("download job {0} not found")]
    NotFound(JobId),

    /// The requested transition is not legal from the job's current state.
    #[error("cannot {action} job {id} while it is {status}")]
    InvalidTransition {
        id: JobId,
        action: &'static str,
        status: DownloadStatus,
    },

    /// Only finished jobs can be removed from the history.
    #[error("job {id} is {status}; only finished jobs can be removed from history")]
    NotTerminal { id: JobId, status: DownloadStatus },

    /// The job failed in a way retrying cannot fix.
    #[error("job {id} failed permanently and cannot be retried: {reason}")]
    NotRetryable { id: JobId, reason: String },

    /// The download target was empty or malformed.
    #[error("invalid download target: {0:?}")]
    InvalidTarget(String),

    /// The manager must be created inside a Tokio runtime.
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(String),

    /// The history log could not be read or written.
    #[error("download history error: {0}")]
    History(#[from] StoreError),
}

/// Result type for download manager operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

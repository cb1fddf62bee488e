//! Errors returned by sync operations.

use thiserror::Error;

use super::conflict::ConflictError;
use crate::persistence::StoreError;

/// Failures of a sync pass.
///
/// An aborted conflict session is not one of these: it surfaces as
/// [`super::SyncOutcome::Skipped`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// The progress service could not be reached.
    #[error("progress service unreachable: {0}")]
    Network(String),

    /// The progress service refused the request.
    #[error("progress service rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The progress service answered with something unreadable.
    #[error("malformed response from progress service: {0}")]
    Decode(String),

    /// The service base URL is unusable.
    #[error("invalid progress service URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    /// A directive named an entity with no local record or server copy.
    #[error("no record for {0}")]
    MissingRecord(String),

    /// Background passes need a Tokio runtime.
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(String),

    /// The coordinator rejected the batch.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// The local store failed.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

//! Local persistence.
//!
//! Two stores back the core:
//!
//! - [`LocalStore`] holds per-entity progress records with their sync-pending
//!   flag and last-known server baseline.
//! - [`DownloadHistory`] retains snapshots of finished download jobs, bounded
//!   to a configured count.
//!
//! Each has an in-memory implementation and a JSON-file implementation that
//! rewrites its file atomically on every change.

mod history;
mod json;
mod local;

use std::path::PathBuf;

use thiserror::Error;

pub use history::{
    DownloadHistory, JsonFileDownloadHistory, MemoryDownloadHistory, DEFAULT_HISTORY_LIMIT,
};
pub use local::{JsonFileStore, LocalStore, MemoryStore};

/// Errors from the local stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backing file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backing file holds malformed JSON.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be encoded.
    #[error("failed to encode store contents: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

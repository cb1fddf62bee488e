//! Download lifecycle states and the legal transitions between them.
//!
//! ```text
//! queued ──► preparing ──► creating-package ──► downloading ──► completed
//!   ▲            │                 │             │  ▲   │
//!   │            └──── (offline) ──┴──► queued   ▼  │   └──► compressing ──► completed
//!   │                                          paused
//!   │
//!   └── error (explicit retry only)
//!
//! every non-terminal state ──► cancelled
//! preparing / creating-package / downloading / compressing ──► error
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadStatus {
    /// Accepted, waiting for connectivity and a free slot.
    Queued,
    /// Resolving the course manifest.
    Preparing,
    /// Laying out the local package.
    CreatingPackage,
    /// Transferring file bytes.
    Downloading,
    /// Packaging downloaded files.
    Compressing,
    /// Transfer suspended; all progress retained.
    Paused,
    /// Finished successfully.
    Completed,
    /// Stopped by the user.
    Cancelled,
    /// Failed; see the job's captured error.
    Error,
}

impl DownloadStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [DownloadStatus; 9] = [
        Self::Queued,
        Self::Preparing,
        Self::CreatingPackage,
        Self::Downloading,
        Self::Compressing,
        Self::Paused,
        Self::Completed,
        Self::Cancelled,
        Self::Error,
    ];

    /// Wire/display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Preparing => "preparing",
            Self::CreatingPackage => "creating-package",
            Self::Downloading => "downloading",
            Self::Compressing => "compressing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Terminal states have no outgoing transitions, except the explicit
    /// retry of an `error` job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }

    /// States in which a worker is running and a concurrency slot is held.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::CreatingPackage | Self::Downloading | Self::Compressing
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;

        match (self, next) {
            (_, Cancelled) => !self.is_terminal(),
            (Queued, Preparing) => true,
            (Preparing, CreatingPackage) | (Preparing, Queued) | (Preparing, Error) => true,
            (CreatingPackage, Downloading)
            | (CreatingPackage, Queued)
            | (CreatingPackage, Error) => true,
            (Downloading, Paused)
            | (Downloading, Compressing)
            | (Downloading, Completed)
            | (Downloading, Error) => true,
            (Paused, Downloading) => true,
            (Compressing, Completed) | (Compressing, Error) => true,
            (Error, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseReason {
    /// The user paused it; only the user resumes it.
    User,
    /// Connectivity was lost; resumed automatically when it returns.
    Offline,
    /// Resume was requested while every slot was taken; resumed ahead of
    /// queued jobs when one frees up.
    WaitingForSlot,
}

//! Events published by the download manager.

use serde::Serialize;

use super::job::{CourseSummary, JobFailure, JobId};
use super::state::DownloadStatus;

/// A throttled progress report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub id: JobId,
    /// Percentage, 0 to 100.
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<u64>,
    pub current_file: Option<String>,
    pub status: DownloadStatus,
}

/// Lifecycle and progress notifications.
///
/// Events for one job are delivered in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DownloadEvent {
    /// A job was accepted into the queue.
    Queued { id: JobId, target_entity_id: String },
    /// A job attempt left the queue and began preparing.
    Started { id: JobId },
    /// The job moved between states.
    StatusChanged {
        id: JobId,
        from: DownloadStatus,
        to: DownloadStatus,
    },
    /// Byte-level progress.
    Progress(ProgressUpdate),
    /// The job finished.
    Completed { id: JobId, course: CourseSummary },
    /// The job failed.
    Error { id: JobId, error: JobFailure },
}

impl DownloadEvent {
    /// Job the event is about.
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Queued { id, .. }
            | Self::Started { id }
            | Self::StatusChanged { id, .. }
            | Self::Completed { id, .. }
            | Self::Error { id, .. } => *id,
            Self::Progress(update) => update.id,
        }
    }
}

//! Download job model.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::{DownloadStatus, PauseReason};

/// Opaque job identifier, unique for the lifetime of the process and stable
/// across pause, resume and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

/// Caller-supplied download options, carried through untouched apart from
/// the fields the manager reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadOptions {
    /// Package the downloaded files (adds the `compressing` stage).
    pub package: bool,
    /// Per-operation stall bound; falls back to the manager default.
    pub operation_timeout: Option<Duration>,
    /// Opaque pass-through options for the course source.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DownloadOptions {
    /// Request packaging.
    pub fn with_package(mut self, package: bool) -> Self {
        self.package = package;
        self
    }

    /// Override the operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}

/// Course identity reported on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSummary {
    /// Course id on the remote service.
    pub id: String,
    /// Human-readable title.
    pub title: String,
}

/// Whether retrying a failed job is sensible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Network drop, timeout, corrupted transfer.
    Transient,
    /// Target gone, disk write failure.
    Permanent,
}

/// A failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct JobFailure {
    /// Retry classification.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

impl JobFailure {
    /// A retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// A non-retryable failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Whether the caller should offer a retry.
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Snapshot of a download job.
///
/// The manager owns the live copy; everything handed out is a clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: JobId,
    pub status: DownloadStatus,
    pub target_entity_id: String,
    /// Known once the manifest has been resolved.
    pub course: Option<CourseSummary>,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub files_planned: usize,
    pub files_completed: usize,
    pub current_file_name: Option<String>,
    /// Moving average over recent samples, not a lifetime average.
    pub speed_bytes_per_sec: f64,
    /// `None` while the speed is zero.
    pub eta_seconds: Option<u64>,
    pub error: Option<JobFailure>,
    pub pause_reason: Option<PauseReason>,
    /// Attempt number, incremented by each retry.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job reached its terminal state, whichever it was.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Where the finished package lives.
    pub output_path: Option<PathBuf>,
    pub options: DownloadOptions,
}

impl DownloadJob {
    /// A freshly queued job.
    pub fn new(
        id: JobId,
        target_entity_id: impl Into<String>,
        options: DownloadOptions,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: DownloadStatus::Queued,
            target_entity_id: target_entity_id.into(),
            course: None,
            total_bytes: 0,
            downloaded_bytes: 0,
            files_planned: 0,
            files_completed: 0,
            current_file_name: None,
            speed_bytes_per_sec: 0.0,
            eta_seconds: None,
            error: None,
            pause_reason: None,
            attempt: 1,
            created_at,
            completed_at: None,
            finished_at: None,
            output_path: None,
            options,
        }
    }

    /// Progress as a percentage.
    ///
    /// Falls back to file-based progress if the total size is unknown.
    pub fn progress_percent(&self) -> f64 {
        if self.status == DownloadStatus::Completed {
            return 100.0;
        }
        if self.total_bytes == 0 {
            if self.files_planned == 0 {
                0.0
            } else {
                (self.files_completed as f64 / self.files_planned as f64) * 100.0
            }
        } else {
            ((self.downloaded_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        }
    }

    /// Eviction order among finished jobs: earliest finish first.
    ///
    /// Jobs without a finish time sort by creation.
    pub fn finish_order(&self) -> (DateTime<Utc>, JobId) {
        (self.finished_at.unwrap_or(self.created_at), self.id)
    }

    /// Bytes still to transfer.
    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.downloaded_bytes)
    }

    /// Reset counters for a fresh attempt.
    pub(crate) fn reset_progress(&mut self) {
        self.course = None;
        self.total_bytes = 0;
        self.downloaded_bytes = 0;
        self.files_planned = 0;
        self.files_completed = 0;
        self.current_file_name = None;
        self.speed_bytes_per_sec = 0.0;
        self.eta_seconds = None;
        self.error = None;
        self.pause_reason = None;
        self.completed_at = None;
        self.finished_at = None;
        self.output_path = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> DownloadJob {
        DownloadJob::new(JobId(1), "course-1", DownloadOptions::default(), Utc::now())
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = job();
        assert_eq!(job.status, DownloadStatus::Queued);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.progress_percent(), 0.0);
    }

    #[test]
    fn test_progress_by_bytes() {
        let mut job = job();
        job.total_bytes = 1000;
        job.downloaded_bytes = 250;
        assert_eq!(job.progress_percent(), 25.0);
        assert_eq!(job.remaining_bytes(), 750);
    }

    #[test]
    fn test_progress_by_files_when_size_unknown() {
        let mut job = job();
        job.files_planned = 4;
        job.files_completed = 1;
        assert_eq!(job.progress_percent(), 25.0);
    }

    #[test]
    fn test_finish_order_prefers_finish_time() {
        let mut early = job();
        let mut late = DownloadJob::new(
            JobId(2),
            "course-2",
            DownloadOptions::default(),
            early.created_at + chrono::Duration::minutes(1),
        );
        assert!(early.finish_order() < late.finish_order());

        late.finished_at = Some(late.created_at + chrono::Duration::minutes(1));
        early.finished_at = Some(late.created_at + chrono::Duration::minutes(5));
        assert!(late.finish_order() < early.finish_order());
    }

    #[test]
    fn test_failure_classification() {
        assert!(JobFailure::transient("network dropped").is_retryable());
        assert!(!JobFailure::permanent("course gone").is_retryable());
        assert_eq!(JobFailure::permanent("disk full").to_string(), "disk full");
    }

    #[test]
    fn test_options_round_trip_with_extra_fields() {
        let json = r#"{"package":true,"quality":"hd"}"#;
        let options: DownloadOptions = serde_json::from_str(json).unwrap();
        assert!(options.package);
        assert!(options.operation_timeout.is_none());
        // Unknown keys are not captured by `extra` unless nested under it.
        assert!(options.extra.is_empty());

        let json = r#"{"extra":{"quality":"hd"}}"#;
        let options: DownloadOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.extra["quality"], "hd");
    }
}

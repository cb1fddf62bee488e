//! In-memory job table owned by the download manager.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::job::{DownloadJob, JobId};
use super::progress::{ProgressThrottle, SpeedTracker};
use super::source::DownloadPlan;
use super::state::{DownloadStatus, PauseReason};

/// Live state of one job.
#[derive(Debug)]
pub(crate) struct JobEntry {
    pub job: DownloadJob,
    /// Resolved manifest, kept across pause and resume.
    pub plan: Option<DownloadPlan>,
    /// Bytes of the current file already written.
    pub current_file_offset: u64,
    /// Cancels the running worker, if any.
    pub worker: Option<CancellationToken>,
    /// Bumped whenever a worker is started; stale workers compare against it.
    pub generation: u64,
    /// Queue position; lower runs first.
    pub queued_seq: u64,
    pub speed: SpeedTracker,
    pub throttle: ProgressThrottle,
}

impl JobEntry {
    /// Stop the running worker, if any.
    pub fn stop_worker(&mut self) {
        if let Some(token) = self.worker.take() {
            token.cancel();
        }
    }

    /// Clear per-attempt transfer state.
    pub fn reset_transfer(&mut self) {
        self.plan = None;
        self.current_file_offset = 0;
        self.speed.reset();
        self.job.reset_progress();
    }
}

/// Table of jobs in creation order.
#[derive(Debug)]
pub(crate) struct JobRegistry {
    entries: HashMap<JobId, JobEntry>,
    order: Vec<JobId>,
    next_seq: u64,
    speed_window: Duration,
    progress_interval: Duration,
}

impl JobRegistry {
    pub fn new(speed_window: Duration, progress_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            next_seq: 0,
            speed_window,
            progress_interval,
        }
    }

    /// Add a job. Replaces any job with the same id.
    pub fn insert(&mut self, job: DownloadJob) {
        let id = job.id;
        let queued_seq = self.take_seq();
        let entry = JobEntry {
            job,
            plan: None,
            current_file_offset: 0,
            worker: None,
            generation: 0,
            queued_seq,
            speed: SpeedTracker::new(self.speed_window),
            throttle: ProgressThrottle::new(self.progress_interval),
        };
        if self.entries.insert(id, entry).is_none() {
            self.order.push(id);
        }
    }

    /// Next queue position.
    pub fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn get(&self, id: JobId) -> Option<&JobEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut JobEntry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn remove(&mut self, id: JobId) -> Option<JobEntry> {
        let entry = self.entries.remove(&id)?;
        self.order.retain(|other| *other != id);
        Some(entry)
    }

    /// Job snapshots in creation order.
    pub fn snapshots(&self) -> Vec<DownloadJob> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.job.clone())
            .collect()
    }

    /// Ids of jobs in `status`, in creation order.
    pub fn ids_with_status(&self, status: DownloadStatus) -> Vec<JobId> {
        self.order
            .iter()
            .filter(|id| {
                self.entries
                    .get(id)
                    .is_some_and(|entry| entry.job.status == status)
            })
            .copied()
            .collect()
    }

    /// Queued job that has waited longest.
    pub fn next_queued(&self) -> Option<JobId> {
        self.entries
            .values()
            .filter(|entry| entry.job.status == DownloadStatus::Queued)
            .min_by_key(|entry| entry.queued_seq)
            .map(|entry| entry.job.id)
    }

    /// Job whose resume has waited longest for a free slot.
    pub fn next_waiting_for_slot(&self) -> Option<JobId> {
        self.entries
            .values()
            .filter(|entry| {
                entry.job.status == DownloadStatus::Paused
                    && entry.job.pause_reason == Some(PauseReason::WaitingForSlot)
            })
            .min_by_key(|entry| entry.queued_seq)
            .map(|entry| entry.job.id)
    }

    /// Jobs holding a concurrency slot.
    pub fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.job.status.is_active())
            .count()
    }

    /// Drop the earliest-finished terminal jobs beyond `limit`. Returns the
    /// removed ids.
    pub fn prune_terminal(&mut self, limit: usize) -> Vec<JobId> {
        let mut terminal: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.job.status.is_terminal())
            .map(|entry| entry.job.finish_order())
            .collect();
        terminal.sort();

        let excess = terminal.len().saturating_sub(limit);
        let removed: Vec<JobId> = terminal.into_iter().take(excess).map(|(_, id)| id).collect();
        for id in &removed {
            self.remove(*id);
        }
        removed
    }

    /// Largest id in the table.
    pub fn max_id(&self) -> Option<JobId> {
        self.entries.keys().max().copied()
    }

    /// Every entry, for bulk operations.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut JobEntry> {
        self.entries.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::job::DownloadOptions;
    use chrono::Utc;

    fn registry_with(statuses: &[DownloadStatus]) -> JobRegistry {
        let mut registry = JobRegistry::new(Duration::from_secs(5), Duration::from_millis(200));
        for (i, status) in statuses.iter().enumerate() {
            let mut job = DownloadJob::new(
                JobId(i as u64 + 1),
                format!("course-{}", i),
                DownloadOptions::default(),
                Utc::now(),
            );
            job.status = *status;
            registry.insert(job);
        }
        registry
    }

    #[test]
    fn test_next_queued_is_fifo() {
        use DownloadStatus::*;
        let mut registry = registry_with(&[Downloading, Queued, Queued]);
        assert_eq!(registry.next_queued(), Some(JobId(2)));

        // Re-queueing moves a job to the back.
        let seq = registry.take_seq();
        registry.get_mut(JobId(2)).unwrap().queued_seq = seq;
        assert_eq!(registry.next_queued(), Some(JobId(3)));
    }

    #[test]
    fn test_active_count_excludes_paused_and_queued() {
        use DownloadStatus::*;
        let registry = registry_with(&[Preparing, Downloading, Paused, Queued, Compressing, Error]);
        assert_eq!(registry.active_count(), 3);
    }

    #[test]
    fn test_prune_keeps_most_recent_terminal_jobs() {
        use DownloadStatus::*;
        let mut registry = registry_with(&[Completed, Downloading, Cancelled, Error, Completed]);

        let removed = registry.prune_terminal(2);
        assert_eq!(removed, vec![JobId(1), JobId(3)]);

        let remaining: Vec<_> = registry.snapshots().iter().map(|j| j.id).collect();
        assert_eq!(remaining, vec![JobId(2), JobId(4), JobId(5)]);
    }

    #[test]
    fn test_prune_evicts_by_finish_time_not_creation() {
        use DownloadStatus::*;
        let mut registry = registry_with(&[Completed, Cancelled, Error]);
        let now = Utc::now();
        for (id, minutes_ago) in [(1, 1), (2, 30), (3, 20)] {
            registry.get_mut(JobId(id)).unwrap().job.finished_at =
                Some(now - chrono::Duration::minutes(minutes_ago));
        }

        // The first-created job finished last and survives.
        assert_eq!(registry.prune_terminal(1), vec![JobId(2), JobId(3)]);
        let remaining: Vec<_> = registry.snapshots().iter().map(|j| j.id).collect();
        assert_eq!(remaining, vec![JobId(1)]);
    }

    #[test]
    fn test_waiting_for_slot_is_fifo_by_wait_order() {
        use DownloadStatus::*;
        let mut registry = registry_with(&[Paused, Paused, Paused]);
        for id in [3, 1] {
            let seq = registry.take_seq();
            let entry = registry.get_mut(JobId(id)).unwrap();
            entry.job.pause_reason = Some(PauseReason::WaitingForSlot);
            entry.queued_seq = seq;
        }
        registry.get_mut(JobId(2)).unwrap().job.pause_reason = Some(PauseReason::User);

        assert_eq!(registry.next_waiting_for_slot(), Some(JobId(3)));
        registry.get_mut(JobId(3)).unwrap().job.pause_reason = None;
        assert_eq!(registry.next_waiting_for_slot(), Some(JobId(1)));
        assert_eq!(registry.next_queued(), None);
    }

    #[test]
    fn test_snapshots_in_creation_order() {
        use DownloadStatus::*;
        let registry = registry_with(&[Queued, Completed, Queued]);
        let ids: Vec<_> = registry.snapshots().iter().map(|j| j.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(registry.max_id(), Some(JobId(3)));
    }
}

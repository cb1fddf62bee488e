//! Bounded log of finished download jobs.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::json::{load_or_default, save_atomic};
use super::StoreResult;
use crate::download::{DownloadJob, JobId};

/// Default number of finished jobs retained.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Storage for terminal job snapshots.
pub trait DownloadHistory: Send + Sync {
    /// All retained jobs, earliest finished first.
    fn load(&self) -> StoreResult<Vec<DownloadJob>>;

    /// Insert or replace a job, evicting the earliest finished beyond the
    /// limit.
    fn record(&self, job: &DownloadJob) -> StoreResult<()>;

    /// Remove a job. Returns whether it was present.
    fn remove(&self, id: JobId) -> StoreResult<bool>;
}

fn upsert(jobs: &mut Vec<DownloadJob>, job: &DownloadJob, limit: usize) {
    jobs.retain(|existing| existing.id != job.id);
    jobs.push(job.clone());
    jobs.sort_by_key(DownloadJob::finish_order);
    let excess = jobs.len().saturating_sub(limit);
    jobs.drain(..excess);
}

/// History kept in memory only.
#[derive(Debug)]
pub struct MemoryDownloadHistory {
    jobs: Mutex<Vec<DownloadJob>>,
    limit: usize,
}

impl MemoryDownloadHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            limit,
        }
    }
}

impl Default for MemoryDownloadHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl DownloadHistory for MemoryDownloadHistory {
    fn load(&self) -> StoreResult<Vec<DownloadJob>> {
        Ok(self.jobs.lock().clone())
    }

    fn record(&self, job: &DownloadJob) -> StoreResult<()> {
        upsert(&mut self.jobs.lock(), job, self.limit);
        Ok(())
    }

    fn remove(&self, id: JobId) -> StoreResult<bool> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        Ok(jobs.len() != before)
    }
}

/// History persisted as a JSON array.
#[derive(Debug)]
pub struct JsonFileDownloadHistory {
    path: PathBuf,
    jobs: Mutex<Vec<DownloadJob>>,
    limit: usize,
}

impl JsonFileDownloadHistory {
    /// Open the log at `path`, creating it on first write.
    pub fn open(path: impl Into<PathBuf>, limit: usize) -> StoreResult<Self> {
        let path = path.into();
        let mut jobs: Vec<DownloadJob> = load_or_default(&path)?;
        jobs.sort_by_key(DownloadJob::finish_order);
        let excess = jobs.len().saturating_sub(limit);
        jobs.drain(..excess);

        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
            limit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DownloadHistory for JsonFileDownloadHistory {
    fn load(&self) -> StoreResult<Vec<DownloadJob>> {
        Ok(self.jobs.lock().clone())
    }

    fn record(&self, job: &DownloadJob) -> StoreResult<()> {
        let mut jobs = self.jobs.lock();
        upsert(&mut jobs, job, self.limit);
        save_atomic(&self.path, &*jobs)
    }

    fn remove(&self, id: JobId) -> StoreResult<bool> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        if jobs.len() == before {
            return Ok(false);
        }
        save_atomic(&self.path, &*jobs)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DownloadOptions, DownloadStatus};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn finished(id: u64, minutes_ago: i64) -> DownloadJob {
        let mut job = DownloadJob::new(
            JobId(id),
            format!("course-{}", id),
            DownloadOptions::default(),
            Utc::now() - Duration::minutes(minutes_ago),
        );
        job.status = DownloadStatus::Completed;
        job
    }

    #[test]
    fn test_memory_history_evicts_oldest() {
        let history = MemoryDownloadHistory::new(2);
        history.record(&finished(1, 30)).unwrap();
        history.record(&finished(2, 20)).unwrap();
        history.record(&finished(3, 10)).unwrap();

        let ids: Vec<_> = history.load().unwrap().iter().map(|j| j.id.0).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_eviction_follows_finish_time() {
        let history = MemoryDownloadHistory::new(1);
        // Created first, finished last.
        let mut long_running = finished(1, 60);
        long_running.finished_at = Some(Utc::now());
        let mut quick = finished(2, 10);
        quick.status = DownloadStatus::Cancelled;
        quick.finished_at = Some(Utc::now() - Duration::minutes(9));

        history.record(&quick).unwrap();
        history.record(&long_running).unwrap();

        let ids: Vec<_> = history.load().unwrap().iter().map(|j| j.id.0).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_record_replaces_same_id() {
        let history = MemoryDownloadHistory::default();
        let mut job = finished(1, 5);
        history.record(&job).unwrap();
        job.status = DownloadStatus::Error;
        history.record(&job).unwrap();

        let jobs = history.load().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, DownloadStatus::Error);
        assert!(history.remove(JobId(1)).unwrap());
        assert!(!history.remove(JobId(1)).unwrap());
    }

    #[test]
    fn test_json_history_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");

        {
            let history = JsonFileDownloadHistory::open(&path, 10).unwrap();
            history.record(&finished(1, 2)).unwrap();
            history.record(&finished(2, 1)).unwrap();
            history.remove(JobId(1)).unwrap();
        }

        let reopened = JsonFileDownloadHistory::open(&path, 10).unwrap();
        let jobs = reopened.load().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, JobId(2));
        assert_eq!(jobs[0].status, DownloadStatus::Completed);
    }

    #[test]
    fn test_json_history_applies_limit_on_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");
        {
            let history = JsonFileDownloadHistory::open(&path, 10).unwrap();
            for id in 1..=5 {
                history.record(&finished(id, 10 - id as i64)).unwrap();
            }
        }

        let reopened = JsonFileDownloadHistory::open(&path, 3).unwrap();
        let ids: Vec<_> = reopened.load().unwrap().iter().map(|j| j.id.0).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }
}

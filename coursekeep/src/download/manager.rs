//! Download lifecycle manager.
//!
//! Owns the job registry and one worker task per running job. Every state
//! change happens under the registry lock and is queued to an event channel
//! in the same critical section, so listeners observe transitions in the
//! order they happened. A separate pump task drains the channel into the
//! listener registry, which keeps listeners free to call back into the
//! manager.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{DownloadError, DownloadResult};
use super::events::{DownloadEvent, ProgressUpdate};
use super::job::{CourseSummary, DownloadJob, DownloadOptions, JobFailure, JobId};
use super::progress::{estimate_eta, DEFAULT_PROGRESS_INTERVAL, DEFAULT_SPEED_WINDOW};
use super::registry::{JobEntry, JobRegistry};
use super::source::{CourseSource, DownloadPlan};
use super::state::{DownloadStatus, PauseReason};
use super::store::PackageStore;
use crate::clock::SharedClock;
use crate::connectivity::ConnectivityMonitor;
use crate::observer::{ListenerId, ListenerRegistry};
use crate::persistence::{DownloadHistory, DEFAULT_HISTORY_LIMIT};

/// Default number of jobs running at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Default bound on any single step of a job (manifest, open, chunk, write).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Download manager settings.
#[derive(Debug, Clone)]
pub struct DownloadManagerConfig {
    /// Jobs allowed in an active state at once.
    pub max_concurrent: usize,
    /// Finished jobs retained in the registry and history.
    pub history_limit: usize,
    /// Stall bound applied unless a job's options override it.
    pub operation_timeout: Duration,
    /// Minimum spacing between progress events of one job.
    pub progress_interval: Duration,
    /// Span of the speed moving average.
    pub speed_window: Duration,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            speed_window: DEFAULT_SPEED_WINDOW,
        }
    }
}

/// Identifies one worker run of one job.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    id: JobId,
    generation: u64,
}

/// Why a worker step did not go ahead.
enum StepError {
    /// The job moved on without this worker (paused, cancelled, re-queued).
    Stale,
    /// The step failed; the job goes to `error`.
    Failed(JobFailure),
}

impl From<JobFailure> for StepError {
    fn from(failure: JobFailure) -> Self {
        Self::Failed(failure)
    }
}

/// Await `operation`, failing transiently if it exceeds `limit`.
async fn bounded<T>(
    limit: Duration,
    what: &str,
    operation: impl Future<Output = Result<T, JobFailure>>,
) -> Result<T, JobFailure> {
    tokio::time::timeout(limit, operation).await.map_err(|_| {
        JobFailure::transient(format!(
            "stalled for {}s while {}",
            limit.as_secs_f64(),
            what
        ))
    })?
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<DownloadEvent>,
    listeners: Arc<ListenerRegistry<DownloadEvent>>,
) {
    while let Some(event) = events.recv().await {
        listeners.dispatch(&event);
    }
}

struct Inner {
    config: DownloadManagerConfig,
    source: Arc<dyn CourseSource>,
    store: Arc<dyn PackageStore>,
    history: Arc<dyn DownloadHistory>,
    connectivity: Arc<ConnectivityMonitor>,
    clock: SharedClock,
    registry: Mutex<JobRegistry>,
    next_id: AtomicU64,
    listeners: Arc<ListenerRegistry<DownloadEvent>>,
    events: mpsc::UnboundedSender<DownloadEvent>,
    runtime: Handle,
}

/// Runs course downloads through their lifecycle.
///
/// Jobs wait in `queued` while the connectivity monitor reports offline and
/// while all concurrency slots are taken. Losing connectivity pauses running
/// transfers; regaining it resumes them and starts queued jobs.
pub struct DownloadManager {
    inner: Arc<Inner>,
    connectivity_listener: ListenerId,
}

impl DownloadManager {
    /// Create a manager. Must be called inside a Tokio runtime.
    ///
    /// Finished jobs found in `history` are loaded into the registry.
    pub fn new(
        config: DownloadManagerConfig,
        source: Arc<dyn CourseSource>,
        store: Arc<dyn PackageStore>,
        history: Arc<dyn DownloadHistory>,
        connectivity: Arc<ConnectivityMonitor>,
        clock: SharedClock,
    ) -> DownloadResult<Self> {
        let runtime =
            Handle::try_current().map_err(|e| DownloadError::NoRuntime(e.to_string()))?;

        let config = DownloadManagerConfig {
            max_concurrent: config.max_concurrent.max(1),
            ..config
        };

        let mut registry = JobRegistry::new(config.speed_window, config.progress_interval);
        let mut restored = 0usize;
        for job in history.load()? {
            if job.status.is_terminal() {
                registry.insert(job);
                restored += 1;
            }
        }
        registry.prune_terminal(config.history_limit);
        let next_id = registry.max_id().map_or(1, |id| id.0 + 1);

        let listeners = Arc::new(ListenerRegistry::new());
        let (events, receiver) = mpsc::unbounded_channel();
        runtime.spawn(pump_events(receiver, Arc::clone(&listeners)));

        let inner = Arc::new(Inner {
            config,
            source,
            store,
            history,
            connectivity,
            clock,
            registry: Mutex::new(registry),
            next_id: AtomicU64::new(next_id),
            listeners,
            events,
            runtime,
        });

        let weak = Arc::downgrade(&inner);
        let connectivity_listener = inner.connectivity.subscribe(move |online: &bool| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connectivity_change(*online);
            }
        });

        info!(
            max_concurrent = inner.config.max_concurrent,
            restored, "Download manager ready"
        );

        Ok(Self {
            inner,
            connectivity_listener,
        })
    }

    /// Queue a download of `target_entity_id`.
    pub fn download_course(
        &self,
        target_entity_id: &str,
        options: DownloadOptions,
    ) -> DownloadResult<JobId> {
        let target = target_entity_id.trim();
        if target.is_empty() {
            return Err(DownloadError::InvalidTarget(target_entity_id.to_string()));
        }

        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let job = DownloadJob::new(id, target, options, self.inner.clock.now());
        {
            let mut registry = self.inner.registry.lock();
            registry.insert(job);
            self.inner.emit(DownloadEvent::Queued {
                id,
                target_entity_id: target.to_string(),
            });
        }
        info!(
            job_id = %id,
            target = %target,
            online = self.inner.connectivity.is_online(),
            "Download queued"
        );

        self.inner.schedule();
        Ok(id)
    }

    /// Pause a running transfer. Progress is retained.
    ///
    /// Pausing a job that connectivity loss already paused makes the pause
    /// sticky: it will no longer resume on reconnect.
    pub fn pause_download(&self, id: JobId) -> DownloadResult<()> {
        {
            let mut registry = self.inner.registry.lock();
            let entry = registry.get_mut(id).ok_or(DownloadError::NotFound(id))?;

            match entry.job.status {
                DownloadStatus::Downloading => {
                    entry.stop_worker();
                    entry.job.pause_reason = Some(PauseReason::User);
                    self.inner.transition(entry, DownloadStatus::Paused);
                }
                DownloadStatus::Paused => {
                    entry.job.pause_reason = Some(PauseReason::User);
                    return Ok(());
                }
                status => {
                    return Err(DownloadError::InvalidTransition {
                        id,
                        action: "pause",
                        status,
                    })
                }
            }
        }
        info!(job_id = %id, "Download paused");

        self.inner.schedule();
        Ok(())
    }

    /// Resume a paused job from where it stopped.
    ///
    /// While offline the job stays paused and resumes on reconnect. With every
    /// slot taken it stays paused until one frees up, ahead of queued jobs.
    pub fn resume_download(&self, id: JobId) -> DownloadResult<()> {
        let mut registry = self.inner.registry.lock();
        let entry = registry.get_mut(id).ok_or(DownloadError::NotFound(id))?;

        if entry.job.status != DownloadStatus::Paused {
            return Err(DownloadError::InvalidTransition {
                id,
                action: "resume",
                status: entry.job.status,
            });
        }

        if !self.inner.connectivity.is_online() {
            entry.job.pause_reason = Some(PauseReason::Offline);
            info!(job_id = %id, "Offline; download will resume on reconnect");
            return Ok(());
        }

        if registry.active_count() >= self.inner.config.max_concurrent {
            self.inner.wait_for_slot(&mut registry, id);
            info!(job_id = %id, "All download slots busy; resume deferred");
            return Ok(());
        }

        let Some(entry) = registry.get_mut(id) else {
            return Err(DownloadError::NotFound(id));
        };
        self.inner.resume_entry(entry);
        info!(job_id = %id, downloaded = entry.job.downloaded_bytes, "Download resumed");
        Ok(())
    }

    /// Cancel a job. Always succeeds for known jobs; finished jobs are left
    /// as they are.
    pub fn cancel_download(&self, id: JobId) -> DownloadResult<()> {
        let snapshot = {
            let mut registry = self.inner.registry.lock();
            let entry = registry.get_mut(id).ok_or(DownloadError::NotFound(id))?;
            if entry.job.status.is_terminal() {
                return Ok(());
            }

            entry.stop_worker();
            entry.job.pause_reason = None;
            entry.job.current_file_name = None;
            self.inner.transition(entry, DownloadStatus::Cancelled);
            entry.job.clone()
        };
        info!(job_id = %id, "Download cancelled");

        self.inner.discard(id);
        self.inner.finish(snapshot);
        Ok(())
    }

    /// Start a fresh attempt of a failed job under the same id.
    pub fn retry_download(&self, id: JobId) -> DownloadResult<()> {
        {
            let mut registry = self.inner.registry.lock();
            let entry = registry.get(id).ok_or(DownloadError::NotFound(id))?;

            if entry.job.status != DownloadStatus::Error {
                return Err(DownloadError::InvalidTransition {
                    id,
                    action: "retry",
                    status: entry.job.status,
                });
            }
            if let Some(failure) = entry.job.error.as_ref().filter(|f| !f.is_retryable()) {
                return Err(DownloadError::NotRetryable {
                    id,
                    reason: failure.message.clone(),
                });
            }

            let queued_seq = registry.take_seq();
            let Some(entry) = registry.get_mut(id) else {
                return Err(DownloadError::NotFound(id));
            };
            entry.reset_transfer();
            entry.job.attempt += 1;
            entry.queued_seq = queued_seq;
            self.inner.transition(entry, DownloadStatus::Queued);
            info!(job_id = %id, attempt = entry.job.attempt, "Download retry queued");
        }

        if let Err(e) = self.inner.history.remove(id) {
            warn!(job_id = %id, error = %e, "Failed to drop retried job from history");
        }
        self.inner.schedule();
        Ok(())
    }

    /// Snapshots of every known job, in creation order.
    pub fn get_all_downloads(&self) -> Vec<DownloadJob> {
        self.inner.registry.lock().snapshots()
    }

    /// Snapshot of one job.
    pub fn get_download_status(&self, id: JobId) -> DownloadResult<DownloadJob> {
        self.inner
            .registry
            .lock()
            .get(id)
            .map(|entry| entry.job.clone())
            .ok_or(DownloadError::NotFound(id))
    }

    /// Forget a finished job.
    pub fn remove_from_history(&self, id: JobId) -> DownloadResult<()> {
        {
            let mut registry = self.inner.registry.lock();
            let entry = registry.get(id).ok_or(DownloadError::NotFound(id))?;
            if !entry.job.status.is_terminal() {
                return Err(DownloadError::NotTerminal {
                    id,
                    status: entry.job.status,
                });
            }
            registry.remove(id);
        }
        self.inner.discard(id);
        self.inner.history.remove(id)?;
        debug!(job_id = %id, "Removed from download history");
        Ok(())
    }

    /// Register a lifecycle/progress listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    /// Remove a listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Jobs currently holding a concurrency slot.
    pub fn active_count(&self) -> usize {
        self.inner.registry.lock().active_count()
    }

    /// Effective configuration.
    pub fn config(&self) -> &DownloadManagerConfig {
        &self.inner.config
    }

    /// Stop every running worker. Job states are left as they are.
    pub fn shutdown(&self) {
        let mut registry = self.inner.registry.lock();
        for entry in registry.entries_mut() {
            entry.stop_worker();
        }
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.inner.connectivity.unsubscribe(self.connectivity_listener);
        self.shutdown();
    }
}

impl Inner {
    /// Queue an event. Callers hold the registry lock so order is preserved.
    fn emit(&self, event: DownloadEvent) {
        // The pump only stops once the runtime shuts down.
        let _ = self.events.send(event);
    }

    /// Move `entry` to `to`, publishing the change. Illegal moves are refused.
    fn transition(&self, entry: &mut JobEntry, to: DownloadStatus) -> bool {
        let from = entry.job.status;
        if !from.can_transition_to(to) {
            warn!(job_id = %entry.job.id, %from, %to, "Refusing illegal download transition");
            return false;
        }

        entry.job.status = to;
        if to != DownloadStatus::Downloading {
            entry.speed.reset();
            entry.job.speed_bytes_per_sec = 0.0;
            entry.job.eta_seconds = None;
        }
        if to.is_terminal() {
            let now = self.clock.now();
            entry.job.finished_at = Some(now);
            if to == DownloadStatus::Completed {
                entry.job.completed_at = Some(now);
            }
        }

        debug!(job_id = %entry.job.id, %from, %to, "Download status changed");
        self.emit(DownloadEvent::StatusChanged {
            id: entry.job.id,
            from,
            to,
        });
        true
    }

    /// Publish a progress snapshot, subject to the throttle unless forced.
    fn emit_progress(&self, entry: &mut JobEntry, force: bool) {
        let now = self.clock.instant();
        if force {
            entry.throttle.mark(now);
        } else if !entry.throttle.should_emit(now) {
            return;
        }

        let job = &entry.job;
        self.emit(DownloadEvent::Progress(ProgressUpdate {
            id: job.id,
            progress: job.progress_percent(),
            downloaded_bytes: job.downloaded_bytes,
            total_bytes: job.total_bytes,
            speed_bytes_per_sec: job.speed_bytes_per_sec,
            eta_seconds: job.eta_seconds,
            current_file: job.current_file_name.clone(),
            status: job.status,
        }));
    }

    /// Fill free slots while the network is usable: paused jobs waiting for
    /// a slot first, then queued jobs, each in arrival order.
    fn schedule(self: &Arc<Self>) {
        if !self.connectivity.is_online() {
            debug!("Offline; queued downloads wait for connectivity");
            return;
        }

        let mut registry = self.registry.lock();
        while registry.active_count() < self.config.max_concurrent {
            if let Some(id) = registry.next_waiting_for_slot() {
                let Some(entry) = registry.get_mut(id) else {
                    break;
                };
                if !self.resume_entry(entry) {
                    break;
                }
                info!(job_id = %id, "Download resumed in a freed slot");
                continue;
            }

            let Some(id) = registry.next_queued() else {
                break;
            };
            let Some(entry) = registry.get_mut(id) else {
                break;
            };
            if !self.transition(entry, DownloadStatus::Preparing) {
                break;
            }
            self.emit(DownloadEvent::Started { id });
            info!(
                job_id = %id,
                target = %entry.job.target_entity_id,
                attempt = entry.job.attempt,
                "Download started"
            );
            self.spawn_worker(entry);
        }
    }

    fn resume_entry(self: &Arc<Self>, entry: &mut JobEntry) -> bool {
        entry.job.pause_reason = None;
        let resumed = self.transition(entry, DownloadStatus::Downloading);
        if resumed {
            self.spawn_worker(entry);
        }
        resumed
    }

    /// Park a paused job behind those already waiting for a slot.
    fn wait_for_slot(&self, registry: &mut JobRegistry, id: JobId) {
        let waiting = registry
            .get(id)
            .is_some_and(|entry| entry.job.pause_reason == Some(PauseReason::WaitingForSlot));
        if waiting {
            return;
        }
        let seq = registry.take_seq();
        if let Some(entry) = registry.get_mut(id) {
            entry.job.pause_reason = Some(PauseReason::WaitingForSlot);
            entry.queued_seq = seq;
        }
    }

    fn on_connectivity_change(self: &Arc<Self>, online: bool) {
        if online {
            {
                let mut registry = self.registry.lock();
                for id in registry.ids_with_status(DownloadStatus::Paused) {
                    let offline = registry
                        .get(id)
                        .is_some_and(|entry| entry.job.pause_reason == Some(PauseReason::Offline));
                    if offline {
                        self.wait_for_slot(&mut registry, id);
                    }
                }
            }
            // Offline-paused jobs take free slots before queued ones.
            self.schedule();
            return;
        }

        {
            let mut registry = self.registry.lock();
            let running: Vec<JobId> = registry
                .snapshots()
                .into_iter()
                .filter(|job| job.status.is_active())
                .map(|job| job.id)
                .collect();

            for id in running {
                let Some(entry) = registry.get_mut(id) else {
                    continue;
                };
                match entry.job.status {
                    DownloadStatus::Downloading => {
                        entry.stop_worker();
                        entry.job.pause_reason = Some(PauseReason::Offline);
                        self.transition(entry, DownloadStatus::Paused);
                        info!(job_id = %id, "Download paused: connectivity lost");
                    }
                    DownloadStatus::Preparing | DownloadStatus::CreatingPackage => {
                        entry.stop_worker();
                        entry.reset_transfer();
                        self.transition(entry, DownloadStatus::Queued);
                        info!(job_id = %id, "Download re-queued: connectivity lost");
                    }
                    // Packaging is local work and carries on.
                    _ => {}
                }
            }

            for id in registry.ids_with_status(DownloadStatus::Paused) {
                let Some(entry) = registry.get_mut(id) else {
                    continue;
                };
                if entry.job.pause_reason == Some(PauseReason::WaitingForSlot) {
                    entry.job.pause_reason = Some(PauseReason::Offline);
                }
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, entry: &mut JobEntry) {
        entry.stop_worker();
        entry.generation += 1;
        entry.speed.reset();

        let cancel = CancellationToken::new();
        entry.worker = Some(cancel.clone());

        let ticket = Ticket {
            id: entry.job.id,
            generation: entry.generation,
        };
        let inner = Arc::clone(self);

        self.runtime.spawn(async move {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(job_id = %ticket.id, generation = ticket.generation, "Download worker stopped");
                }

                result = inner.drive(ticket) => match result {
                    Ok(()) => {}
                    Err(StepError::Stale) => {
                        debug!(job_id = %ticket.id, "Download worker superseded");
                    }
                    Err(StepError::Failed(failure)) => inner.fail(ticket, failure),
                },
            }
        });
    }

    /// Run `f` on the job if `ticket` is still current.
    fn read<R>(&self, ticket: Ticket, f: impl FnOnce(&JobEntry) -> R) -> Result<R, StepError> {
        let registry = self.registry.lock();
        match registry.get(ticket.id) {
            Some(entry) if entry.generation == ticket.generation => Ok(f(entry)),
            _ => Err(StepError::Stale),
        }
    }

    /// Mutate the job if `ticket` is still current and the job is in one of
    /// `expected`.
    fn update<R>(
        &self,
        ticket: Ticket,
        expected: &[DownloadStatus],
        f: impl FnOnce(&Self, &mut JobEntry) -> R,
    ) -> Result<R, StepError> {
        let mut registry = self.registry.lock();
        match registry.get_mut(ticket.id) {
            Some(entry)
                if entry.generation == ticket.generation
                    && expected.contains(&entry.job.status) =>
            {
                Ok(f(self, entry))
            }
            _ => Err(StepError::Stale),
        }
    }

    /// Take the job from wherever its worker picked it up to completion.
    async fn drive(self: &Arc<Self>, ticket: Ticket) -> Result<(), StepError> {
        let (start, target, options) = self.read(ticket, |entry| {
            (
                entry.job.status,
                entry.job.target_entity_id.clone(),
                entry.job.options.clone(),
            )
        })?;
        let limit = options
            .operation_timeout
            .unwrap_or(self.config.operation_timeout);

        if start == DownloadStatus::Preparing {
            // Clear anything a previous attempt left behind.
            bounded(
                limit,
                "clearing a previous attempt",
                self.store.discard(ticket.id),
            )
            .await?;

            let plan = bounded(
                limit,
                "resolving the course manifest",
                self.source.plan(&target, &options),
            )
            .await?;

            self.update(ticket, &[DownloadStatus::Preparing], |inner, entry| {
                entry.job.course = Some(plan.course.clone());
                entry.job.total_bytes = plan.total_bytes();
                entry.job.files_planned = plan.files.len();
                entry.plan = Some(plan.clone());
                inner.transition(entry, DownloadStatus::CreatingPackage);
            })?;

            bounded(
                limit,
                "creating the package",
                self.store.create_package(ticket.id, &plan),
            )
            .await?;

            self.update(ticket, &[DownloadStatus::CreatingPackage], |inner, entry| {
                inner.transition(entry, DownloadStatus::Downloading);
            })?;
        }

        let plan = self
            .read(ticket, |entry| entry.plan.clone())?
            .ok_or_else(|| JobFailure::permanent("download plan missing on resume"))?;

        self.transfer(ticket, &plan, limit).await?;

        if options.package {
            self.update(ticket, &[DownloadStatus::Downloading], |inner, entry| {
                entry.job.current_file_name = None;
                inner.transition(entry, DownloadStatus::Compressing);
            })?;
            bounded(
                limit,
                "compressing the package",
                self.store.compress(ticket.id, &plan),
            )
            .await?;
        }

        let output = bounded(
            limit,
            "finalizing the package",
            self.store.finalize(ticket.id, &plan),
        )
        .await?;

        self.complete(ticket, output, plan.course.clone())
    }

    /// Fetch every file not yet completed, continuing the current one at its
    /// recorded offset.
    async fn transfer(
        self: &Arc<Self>,
        ticket: Ticket,
        plan: &DownloadPlan,
        limit: Duration,
    ) -> Result<(), StepError> {
        loop {
            let (index, offset) =
                self.update(ticket, &[DownloadStatus::Downloading], |_, entry| {
                    (entry.job.files_completed, entry.current_file_offset)
                })?;
            let Some(file) = plan.files.get(index) else {
                return Ok(());
            };

            self.update(ticket, &[DownloadStatus::Downloading], |inner, entry| {
                entry.job.current_file_name = Some(file.name.clone());
                inner.emit_progress(entry, true);
            })?;

            let mut chunks = bounded(
                limit,
                &format!("opening {}", file.name),
                self.source.open(file, offset),
            )
            .await?;

            let mut written = offset;
            loop {
                let next = tokio::time::timeout(limit, chunks.next())
                    .await
                    .map_err(|_| {
                        JobFailure::transient(format!(
                            "stalled for {}s while downloading {}",
                            limit.as_secs_f64(),
                            file.name
                        ))
                    })?;
                let Some(chunk) = next else {
                    break;
                };
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }

                let len = chunk.len() as u64;
                bounded(
                    limit,
                    &format!("writing {}", file.name),
                    self.store.write_chunk(ticket.id, file, written, chunk),
                )
                .await?;
                written += len;
                self.record_progress(ticket, len)?;
            }

            if file.size > 0 && written < file.size {
                return Err(JobFailure::transient(format!(
                    "transfer of {} ended early ({} of {} bytes)",
                    file.name, written, file.size
                ))
                .into());
            }

            bounded(
                limit,
                &format!("verifying {}", file.name),
                self.store.finish_file(ticket.id, file, written),
            )
            .await?;

            self.update(ticket, &[DownloadStatus::Downloading], |inner, entry| {
                entry.job.files_completed += 1;
                entry.current_file_offset = 0;
                inner.emit_progress(entry, true);
            })?;
        }
    }

    fn record_progress(&self, ticket: Ticket, bytes: u64) -> Result<(), StepError> {
        self.update(ticket, &[DownloadStatus::Downloading], |inner, entry| {
            entry.job.downloaded_bytes += bytes;
            entry.current_file_offset += bytes;

            entry
                .speed
                .record(inner.clock.instant(), entry.job.downloaded_bytes);
            let speed = entry.speed.bytes_per_sec();
            entry.job.speed_bytes_per_sec = speed;
            entry.job.eta_seconds = estimate_eta(entry.job.remaining_bytes(), speed);

            inner.emit_progress(entry, false);
        })
    }

    fn complete(
        self: &Arc<Self>,
        ticket: Ticket,
        output: PathBuf,
        course: CourseSummary,
    ) -> Result<(), StepError> {
        let snapshot = self.update(
            ticket,
            &[DownloadStatus::Downloading, DownloadStatus::Compressing],
            |inner, entry| {
                entry.worker = None;
                entry.job.current_file_name = None;
                entry.job.output_path = Some(output.clone());
                inner.emit_progress(entry, true);
                inner.transition(entry, DownloadStatus::Completed);
                inner.emit(DownloadEvent::Completed {
                    id: entry.job.id,
                    course: course.clone(),
                });
                entry.job.clone()
            },
        )?;

        info!(
            job_id = %ticket.id,
            course = %course.id,
            bytes = snapshot.downloaded_bytes,
            output = %output.display(),
            "Download completed"
        );
        self.finish(snapshot);
        Ok(())
    }

    fn fail(self: &Arc<Self>, ticket: Ticket, failure: JobFailure) {
        let snapshot = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.get_mut(ticket.id) else {
                return;
            };
            if entry.generation != ticket.generation || !entry.job.status.is_active() {
                return;
            }

            entry.worker = None;
            entry.job.current_file_name = None;
            entry.job.error = Some(failure.clone());
            self.transition(entry, DownloadStatus::Error);
            self.emit(DownloadEvent::Error {
                id: ticket.id,
                error: failure.clone(),
            });
            entry.job.clone()
        };

        warn!(
            job_id = %ticket.id,
            retryable = failure.is_retryable(),
            error = %failure,
            "Download failed"
        );
        self.finish(snapshot);
    }

    /// Record a job that reached a terminal state and hand its slot on.
    fn finish(self: &Arc<Self>, snapshot: DownloadJob) {
        if let Err(e) = self.history.record(&snapshot) {
            warn!(job_id = %snapshot.id, error = %e, "Failed to record download history");
        }

        let pruned = self
            .registry
            .lock()
            .prune_terminal(self.config.history_limit);
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Pruned download history");
        }
        for id in pruned {
            self.discard(id);
        }

        self.schedule();
    }

    /// Release the job's partial files in the background.
    fn discard(&self, id: JobId) {
        let store = Arc::clone(&self.store);
        self.runtime.spawn(async move {
            if let Err(e) = store.discard(id).await {
                warn!(job_id = %id, error = %e, "Failed to release partial download");
            }
        });
    }
}

//! Sync passes between the local store and the progress service.
//!
//! A pass, run by [`SyncOrchestrator::sync_once`]:
//!
//! ```text
//! offline? ──yes──► Offline
//!    │
//! pending local edits ──none──► NothingToSync
//!    │
//! fetch server copies ──► detect divergence
//!    │                          │
//!    │                    conflicts? ──► coordinator session ──aborted──► Skipped
//!    │                          │
//!    └──► push non-divergent edits, apply directive ──► Completed
//! ```
//!
//! The merge decision is taken before anything is written, so an aborted
//! session leaves both sides untouched.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::conflict::ConflictResolutionCoordinator;
use super::detect;
use super::error::{SyncError, SyncResult};
use super::model::{
    ConflictRecord, EntityKey, LocalRecord, ResolutionDirective, ServerRecord, Side,
    VersionSnapshot,
};
use super::remote::ProgressService;
use crate::connectivity::ConnectivityMonitor;
use crate::observer::ListenerId;
use crate::persistence::LocalStore;

/// How a sync pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOutcome {
    /// Every pending edit was reconciled.
    Completed,
    /// The connectivity monitor reports offline; nothing was attempted.
    Offline,
    /// No local edits were pending.
    NothingToSync,
    /// The conflict session was aborted; nothing was written. Try again later.
    Skipped,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Offline => "offline",
            Self::NothingToSync => "nothing to sync",
            Self::Skipped => "skipped",
        })
    }
}

/// Summary of a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    /// Local values written to the server.
    pub pushed: usize,
    /// Server values written over local records.
    pub pulled: usize,
    /// Conflicts presented to the coordinator.
    pub conflicts: usize,
}

impl SyncReport {
    fn empty(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            pushed: 0,
            pulled: 0,
            conflicts: 0,
        }
    }
}

/// Counts from applying a directive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedResolution {
    pub pushed: usize,
    pub pulled: usize,
}

/// Reconciles local edits with the progress service.
pub struct SyncOrchestrator {
    connectivity: Arc<ConnectivityMonitor>,
    store: Arc<dyn LocalStore>,
    service: Arc<dyn ProgressService>,
    coordinator: Arc<ConflictResolutionCoordinator>,
    /// One pass at a time.
    pass: tokio::sync::Mutex<()>,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("online", &self.connectivity.is_online())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(
        connectivity: Arc<ConnectivityMonitor>,
        store: Arc<dyn LocalStore>,
        service: Arc<dyn ProgressService>,
        coordinator: Arc<ConflictResolutionCoordinator>,
    ) -> Self {
        Self {
            connectivity,
            store,
            service,
            coordinator,
            pass: tokio::sync::Mutex::new(()),
        }
    }

    pub fn coordinator(&self) -> &Arc<ConflictResolutionCoordinator> {
        &self.coordinator
    }

    /// Whether any local record awaits a push.
    pub fn has_pending_local_changes(&self) -> SyncResult<bool> {
        Ok(self.store.has_pending()?)
    }

    /// Server copies of `keys`.
    pub async fn fetch_server_state(&self, keys: &[EntityKey]) -> SyncResult<Vec<ServerRecord>> {
        self.service.fetch(keys).await
    }

    /// Conflicts between pending `local` records and `server` copies.
    pub fn detect_divergence(
        &self,
        local: &[LocalRecord],
        server: &[ServerRecord],
    ) -> Vec<ConflictRecord> {
        detect::detect_divergence(local, server)
    }

    /// Carry out a directive.
    ///
    /// Local winners are pushed to the server; server winners overwrite the
    /// local record. Either way the record ends up synced with the version
    /// the server now holds.
    pub async fn apply_resolution(
        &self,
        directive: &ResolutionDirective,
    ) -> SyncResult<AppliedResolution> {
        let mut targets = Vec::with_capacity(directive.len());
        for (id, side) in directive.iter() {
            let key: EntityKey = id.parse().map_err(|_| SyncError::MissingRecord(id.to_string()))?;
            targets.push((key, side));
        }

        let pull_keys: Vec<EntityKey> = targets
            .iter()
            .filter(|(_, side)| *side == Side::Server)
            .map(|(key, _)| key.clone())
            .collect();
        let server: HashMap<EntityKey, VersionSnapshot> = if pull_keys.is_empty() {
            HashMap::new()
        } else {
            self.fetch_server_state(&pull_keys)
                .await?
                .into_iter()
                .map(|record| (record.key, record.snapshot))
                .collect()
        };

        let mut applied = AppliedResolution::default();
        for (key, side) in targets {
            let mut record = self
                .store
                .get(&key)?
                .ok_or_else(|| SyncError::MissingRecord(key.to_string()))?;
            match side {
                Side::Local => {
                    let stored = self.service.push(&key, &record.current).await?;
                    record.mark_synced(stored);
                    applied.pushed += 1;
                }
                Side::Server => {
                    let snapshot = server
                        .get(&key)
                        .cloned()
                        .ok_or_else(|| SyncError::MissingRecord(key.to_string()))?;
                    record.mark_synced(snapshot);
                    applied.pulled += 1;
                }
            }
            debug!(entity = %key, %side, "Resolution applied");
            self.store.upsert(record)?;
        }
        Ok(applied)
    }

    /// Run one sync pass.
    ///
    /// Passes are serialised; a second call waits for the first to finish.
    pub async fn sync_once(&self) -> SyncResult<SyncReport> {
        let _pass = self.pass.lock().await;

        if !self.connectivity.is_online() {
            debug!("Sync skipped while offline");
            return Ok(SyncReport::empty(SyncOutcome::Offline));
        }

        let pending = self.store.pending()?;
        if pending.is_empty() {
            return Ok(SyncReport::empty(SyncOutcome::NothingToSync));
        }

        let keys: Vec<EntityKey> = pending.iter().map(|r| r.key.clone()).collect();
        let server = self.fetch_server_state(&keys).await?;
        let conflicts = self.detect_divergence(&pending, &server);
        let conflict_count = conflicts.len();

        let directive = if conflicts.is_empty() {
            ResolutionDirective::new()
        } else {
            info!(conflicts = conflict_count, "Local edits diverged from server");
            match self.coordinator.resolve(conflicts).await {
                Ok(directive) => directive,
                Err(e) if e.is_aborted() => {
                    info!(reason = %e, "Sync round skipped");
                    return Ok(SyncReport {
                        conflicts: conflict_count,
                        ..SyncReport::empty(SyncOutcome::Skipped)
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };

        // Pending edits the server has not contradicted go straight up.
        let mut pushed = 0;
        for mut record in pending {
            if directive.get(&record.key.to_string()).is_some() {
                continue;
            }
            let stored = self.service.push(&record.key, &record.current).await?;
            record.mark_synced(stored);
            self.store.upsert(record)?;
            pushed += 1;
        }

        let applied = self.apply_resolution(&directive).await?;
        let report = SyncReport {
            outcome: SyncOutcome::Completed,
            pushed: pushed + applied.pushed,
            pulled: applied.pulled,
            conflicts: conflict_count,
        };
        info!(
            pushed = report.pushed,
            pulled = report.pulled,
            conflicts = report.conflicts,
            "Sync pass completed"
        );
        Ok(report)
    }

    /// Start a sync pass whenever the monitor goes from offline to online.
    ///
    /// Must be called inside a Tokio runtime. Returns the monitor listener
    /// id; pass it to [`ConnectivityMonitor::unsubscribe`] to stop.
    pub fn sync_on_reconnect(self: &Arc<Self>) -> SyncResult<ListenerId> {
        let runtime = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;
        let weak: Weak<Self> = Arc::downgrade(self);
        Ok(self.connectivity.subscribe(move |online: &bool| {
            if !*online {
                return;
            }
            let Some(orchestrator) = weak.upgrade() else {
                return;
            };
            runtime.spawn(async move {
                match orchestrator.sync_once().await {
                    Ok(report) => debug!(outcome = %report.outcome, "Reconnect sync finished"),
                    Err(e) => warn!(error = %e, "Reconnect sync failed"),
                }
            });
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connectivity::{ConnectivityProbe, MonitorConfig, ProbeBehaviour, StaticProbe};
    use crate::persistence::MemoryStore;
    use crate::sync::conflict::{AbortReason, ConflictError};
    use crate::sync::model::ProgressData;
    use crate::sync::remote::MemoryProgressService;
    use chrono::{Duration, Utc};

    struct Harness {
        probes: Vec<StaticProbe>,
        monitor: Arc<ConnectivityMonitor>,
        store: Arc<MemoryStore>,
        service: Arc<MemoryProgressService>,
        coordinator: Arc<ConflictResolutionCoordinator>,
        orchestrator: Arc<SyncOrchestrator>,
    }

    impl Harness {
        async fn new(online: bool) -> Self {
            let behaviour = if online {
                ProbeBehaviour::Reachable
            } else {
                ProbeBehaviour::Unreachable
            };
            let probes: Vec<StaticProbe> = (0..3)
                .map(|i| StaticProbe::new(format!("probe-{}", i), behaviour))
                .collect();
            let dyn_probes: Vec<Arc<dyn ConnectivityProbe>> = probes
                .iter()
                .map(|p| Arc::new(p.clone()) as Arc<dyn ConnectivityProbe>)
                .collect();
            let monitor = Arc::new(
                ConnectivityMonitor::new(
                    MonitorConfig::default(),
                    dyn_probes,
                    Arc::new(ManualClock::new()),
                )
                .unwrap(),
            );
            monitor.check_connection().await;

            let store = Arc::new(MemoryStore::new());
            let service = Arc::new(MemoryProgressService::new());
            let coordinator = Arc::new(ConflictResolutionCoordinator::new());
            let orchestrator = Arc::new(SyncOrchestrator::new(
                Arc::clone(&monitor),
                Arc::clone(&store) as Arc<dyn LocalStore>,
                Arc::clone(&service) as Arc<dyn ProgressService>,
                Arc::clone(&coordinator),
            ));
            Self {
                probes,
                monitor,
                store,
                service,
                coordinator,
                orchestrator,
            }
        }

        /// A record synced at `baseline`, edited locally to `local`, while
        /// the server moved to `server`.
        fn seed(&self, key: EntityKey, baseline: ProgressData, local: ProgressData, server: ProgressData) {
            let t0 = Utc::now();
            let mut record = LocalRecord::synced(
                key.clone(),
                format!("Entity {}", key.entity_id),
                VersionSnapshot::new(t0, baseline),
            );
            record.edit(local, t0 + Duration::seconds(5));
            self.store.upsert(record).unwrap();
            self.service
                .set_record(key, VersionSnapshot::new(t0 + Duration::seconds(10), server));
        }
    }

    fn progress(p: f64) -> ProgressData {
        ProgressData::default().with_progress(p)
    }

    #[tokio::test]
    async fn test_offline_pass_does_nothing() {
        let h = Harness::new(false).await;
        h.seed(EntityKey::lesson("1"), progress(0.0), progress(50.0), progress(0.0));

        let report = h.orchestrator.sync_once().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::Offline);
        assert!(h.service.pushes().is_empty());
        assert!(h.orchestrator.has_pending_local_changes().unwrap());
    }

    #[tokio::test]
    async fn test_nothing_pending() {
        let h = Harness::new(true).await;
        let report = h.orchestrator.sync_once().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::NothingToSync);
    }

    #[tokio::test]
    async fn test_fast_path_pushes_without_session() {
        let h = Harness::new(true).await;
        // Server still holds the baseline.
        h.seed(EntityKey::lesson("1"), progress(10.0), progress(70.0), progress(10.0));

        let report = h.orchestrator.sync_once().await.unwrap();

        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!((report.pushed, report.pulled, report.conflicts), (1, 0, 0));
        assert_eq!(
            h.service.record(&EntityKey::lesson("1")).unwrap().data.progress,
            Some(70.0)
        );
        assert!(!h.orchestrator.has_pending_local_changes().unwrap());
    }

    #[tokio::test]
    async fn test_conflicts_follow_directive() {
        let h = Harness::new(true).await;
        h.seed(EntityKey::lesson("1"), progress(50.0), progress(80.0), progress(60.0));
        h.seed(
            EntityKey::lesson("2"),
            ProgressData::default().with_completed(false),
            ProgressData::default().with_completed(true),
            ProgressData::default().with_completed(false).with_score(10.0),
        );

        let coordinator = Arc::clone(&h.coordinator);
        h.coordinator.subscribe(move |_| {
            coordinator.select_version("lesson:1", Side::Local).unwrap();
            coordinator.apply().unwrap();
        });

        let report = h.orchestrator.sync_once().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!((report.pushed, report.pulled, report.conflicts), (1, 1, 2));

        // Local won lesson 1.
        assert_eq!(
            h.service.record(&EntityKey::lesson("1")).unwrap().data.progress,
            Some(80.0)
        );
        // Server won lesson 2.
        let local = h.store.get(&EntityKey::lesson("2")).unwrap().unwrap();
        assert_eq!(local.current.data.completed, Some(false));
        assert_eq!(local.current.data.score, Some(10.0));
        assert!(!local.pending_sync);
        assert_eq!(h.service.pushes(), vec![EntityKey::lesson("1")]);
    }

    #[tokio::test]
    async fn test_aborted_session_skips_round() {
        let h = Harness::new(true).await;
        h.seed(EntityKey::lesson("1"), progress(50.0), progress(80.0), progress(60.0));
        // Non-divergent edit that would otherwise be pushed.
        h.seed(EntityKey::quiz("q"), progress(0.0), progress(5.0), progress(0.0));

        let coordinator = Arc::clone(&h.coordinator);
        h.coordinator.subscribe(move |_| coordinator.cancel().unwrap());

        let report = h.orchestrator.sync_once().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::Skipped);
        assert_eq!(report.conflicts, 1);
        assert!(h.service.pushes().is_empty());
        assert_eq!(h.store.pending().unwrap().len(), 2);
        assert!(!h.coordinator.has_pending_session());
    }

    #[tokio::test]
    async fn test_service_failure_is_an_error() {
        let h = Harness::new(true).await;
        h.seed(EntityKey::lesson("1"), progress(0.0), progress(50.0), progress(0.0));
        h.service.set_unreachable(true);

        let err = h.orchestrator.sync_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        assert!(h.orchestrator.has_pending_local_changes().unwrap());
    }

    #[tokio::test]
    async fn test_apply_resolution_unknown_entity() {
        let h = Harness::new(true).await;
        let mut directive = ResolutionDirective::new();
        directive.insert("lesson:404", Side::Local);

        let err = h.orchestrator.apply_resolution(&directive).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingRecord(id) if id == "lesson:404"));
    }

    #[tokio::test]
    async fn test_reconnect_triggers_pass() {
        let h = Harness::new(false).await;
        h.seed(EntityKey::lesson("1"), progress(0.0), progress(40.0), progress(0.0));
        h.orchestrator.sync_on_reconnect().unwrap();

        for probe in &h.probes {
            probe.set(ProbeBehaviour::Reachable);
        }
        assert!(h.monitor.check_connection().await);

        for _ in 0..100 {
            if !h.service.pushes().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(h.service.pushes(), vec![EntityKey::lesson("1")]);
    }

    #[tokio::test]
    async fn test_superseded_session_surfaces_as_skip() {
        let h = Harness::new(true).await;
        h.seed(EntityKey::lesson("1"), progress(50.0), progress(80.0), progress(60.0));

        let orchestrator = Arc::clone(&h.orchestrator);
        let pass = tokio::spawn(async move { orchestrator.sync_once().await });
        for _ in 0..100 {
            if h.coordinator.has_pending_session() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let other = h.coordinator.resolve(vec![ConflictRecord::new(
            &EntityKey::course("c"),
            "Course",
            VersionSnapshot::new(Utc::now(), progress(1.0)),
            VersionSnapshot::new(Utc::now(), progress(2.0)),
        )]);

        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.outcome, SyncOutcome::Skipped);
        h.coordinator.cancel().unwrap();
        assert_eq!(
            other.await.unwrap_err(),
            ConflictError::SessionAborted {
                reason: AbortReason::Cancelled
            }
        );
    }
}

//! End-to-end: work offline, reconnect, let downloads and sync catch up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coursekeep::clock::SystemClock;
use coursekeep::connectivity::{
    ConnectivityMonitor, ConnectivityProbe, MonitorConfig, ProbeBehaviour, StaticProbe,
};
use coursekeep::download::{
    DownloadManager, DownloadManagerConfig, DownloadOptions, DownloadStatus, FsPackageStore,
    JobId, MemoryCourseSource, MANIFEST_FILE,
};
use coursekeep::persistence::{
    DownloadHistory, JsonFileDownloadHistory, JsonFileStore, LocalStore,
};
use coursekeep::sync::{
    ConflictResolutionCoordinator, EntityKey, LocalRecord, MemoryProgressService, ProgressData,
    ProgressService, Side, SyncOrchestrator, SyncOutcome, VersionSnapshot,
};
use tempfile::TempDir;

struct World {
    _temp: TempDir,
    root: std::path::PathBuf,
    probes: Vec<StaticProbe>,
    monitor: Arc<ConnectivityMonitor>,
    source: MemoryCourseSource,
    history: Arc<JsonFileDownloadHistory>,
    manager: DownloadManager,
    store: Arc<JsonFileStore>,
    service: Arc<MemoryProgressService>,
    coordinator: Arc<ConflictResolutionCoordinator>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl World {
    async fn offline() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let probes: Vec<StaticProbe> = ["route", "http", "dns"]
            .iter()
            .map(|name| StaticProbe::new(*name, ProbeBehaviour::Unreachable))
            .collect();
        let monitor = Arc::new(
            ConnectivityMonitor::new(
                MonitorConfig {
                    probe_timeout: Duration::from_millis(200),
                    ..MonitorConfig::default()
                },
                probes
                    .iter()
                    .map(|p| Arc::new(p.clone()) as Arc<dyn ConnectivityProbe>)
                    .collect(),
                Arc::new(SystemClock),
            )
            .unwrap(),
        );
        assert!(!monitor.check_connection().await);

        let source = MemoryCourseSource::gated(8);
        source.add_course(
            "intro-rust",
            "Intro to Rust",
            vec![
                ("lesson-1.md", b"# Ownership\nEvery value has one owner.\n".to_vec()),
                ("quiz-1.json", br#"{"questions":3}"#.to_vec()),
            ],
        );

        let history = Arc::new(JsonFileDownloadHistory::open(root.join("history.json"), 10).unwrap());
        let manager = DownloadManager::new(
            DownloadManagerConfig::default(),
            Arc::new(source.clone()),
            Arc::new(FsPackageStore::new(root.join("downloads"))),
            Arc::clone(&history) as Arc<dyn DownloadHistory>,
            Arc::clone(&monitor),
            Arc::new(SystemClock),
        )
        .unwrap();

        let store = Arc::new(JsonFileStore::open(root.join("local.json")).unwrap());
        let service = Arc::new(MemoryProgressService::new());
        let coordinator = Arc::new(ConflictResolutionCoordinator::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&monitor),
            Arc::clone(&store) as Arc<dyn LocalStore>,
            Arc::clone(&service) as Arc<dyn ProgressService>,
            Arc::clone(&coordinator),
        ));

        Self {
            _temp: temp,
            root,
            probes,
            monitor,
            source,
            history,
            manager,
            store,
            service,
            coordinator,
            orchestrator,
        }
    }

    async fn set_probes(&self, behaviours: [ProbeBehaviour; 3]) -> bool {
        for (probe, behaviour) in self.probes.iter().zip(behaviours) {
            probe.set(behaviour);
        }
        self.monitor.check_connection().await
    }

    async fn wait_status(&self, id: JobId, status: DownloadStatus) {
        for _ in 0..400 {
            if self.manager.get_download_status(id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "job {} never reached {}: {:?}",
            id,
            status,
            self.manager.get_download_status(id).unwrap()
        );
    }

    async fn wait_synced(&self) {
        for _ in 0..400 {
            if !self.store.has_pending().unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("local edits never synced");
    }
}

fn progress(p: f64) -> ProgressData {
    ProgressData::default().with_progress(p)
}

/// Lesson edited offline while the server also moved.
fn seed_conflict(world: &World, key: EntityKey, baseline: f64, local: f64, server: f64) {
    let t0 = Utc::now();
    let mut record = LocalRecord::synced(key.clone(), "Ownership", VersionSnapshot::new(t0, progress(baseline)));
    record.edit(progress(local), Utc::now());
    world.store.upsert(record).unwrap();
    world
        .service
        .set_record(key, VersionSnapshot::new(Utc::now(), progress(server)));
}

/// Lesson edited offline; server untouched.
fn seed_clean_edit(world: &World, key: EntityKey, baseline: f64, local: f64) {
    let t0 = Utc::now();
    let snapshot = VersionSnapshot::new(t0, progress(baseline));
    let mut record = LocalRecord::synced(key.clone(), "Borrowing", snapshot.clone());
    record.edit(progress(local), Utc::now());
    world.store.upsert(record).unwrap();
    world.service.set_record(key, snapshot);
}

#[tokio::test]
async fn test_offline_work_reconciles_after_reconnect() {
    let world = World::offline().await;

    seed_conflict(&world, EntityKey::lesson("ownership"), 40.0, 90.0, 55.0);
    seed_clean_edit(&world, EntityKey::lesson("borrowing"), 0.0, 30.0);

    // The "user" keeps their own answer for the conflicting lesson.
    let ui = Arc::clone(&world.coordinator);
    world.coordinator.subscribe(move |opened| {
        assert_eq!(opened.conflicts.len(), 1);
        ui.select_version(&opened.conflicts[0].id, Side::Local).unwrap();
        ui.apply().unwrap();
    });
    world.orchestrator.sync_on_reconnect().unwrap();

    // Offline: downloads queue, sync declines.
    let id = world
        .manager
        .download_course("intro-rust", DownloadOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(world.manager.get_download_status(id).unwrap().status, DownloadStatus::Queued);
    assert_eq!(
        world.orchestrator.sync_once().await.unwrap().outcome,
        SyncOutcome::Offline
    );

    // One flaky probe does not matter with two of three agreeing.
    use ProbeBehaviour::*;
    assert!(world.set_probes([Reachable, Fail, Reachable]).await);

    world.wait_status(id, DownloadStatus::Downloading).await;
    world.source.release(1_000);
    world.wait_status(id, DownloadStatus::Completed).await;
    world.wait_synced().await;

    // Download landed on disk and in the history file.
    let job = world.manager.get_download_status(id).unwrap();
    let package = job.output_path.clone().unwrap();
    assert_eq!(package, world.root.join("downloads").join("intro-rust"));
    assert!(package.join(MANIFEST_FILE).exists());
    assert_eq!(
        std::fs::read(package.join("quiz-1.json")).unwrap(),
        br#"{"questions":3}"#
    );
    assert!(world.history.load().unwrap().iter().any(|j| j.id == id));

    // Conflict went local, the clean edit went straight up.
    let ownership = world.service.record(&EntityKey::lesson("ownership")).unwrap();
    assert_eq!(ownership.data.progress, Some(90.0));
    let borrowing = world.service.record(&EntityKey::lesson("borrowing")).unwrap();
    assert_eq!(borrowing.data.progress, Some(30.0));
    assert!(!world.coordinator.has_pending_session());

    // Second pass has nothing left to do.
    assert_eq!(
        world.orchestrator.sync_once().await.unwrap().outcome,
        SyncOutcome::NothingToSync
    );
}

#[tokio::test]
async fn test_connection_loss_pauses_and_dismissed_dialog_skips_sync() {
    let world = World::offline().await;
    seed_conflict(&world, EntityKey::quiz("final"), 10.0, 70.0, 20.0);

    let ui = Arc::clone(&world.coordinator);
    world.coordinator.subscribe(move |_| ui.cancel().unwrap());

    use ProbeBehaviour::*;
    assert!(world.set_probes([Reachable, Reachable, Hang]).await);

    let id = world
        .manager
        .download_course("intro-rust", DownloadOptions::default())
        .unwrap();
    world.wait_status(id, DownloadStatus::Downloading).await;
    world.source.release(2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Two probes down: below quorum.
    assert!(!world.set_probes([Unreachable, Reachable, Fail]).await);
    world.wait_status(id, DownloadStatus::Paused).await;
    let paused_at = world.manager.get_download_status(id).unwrap().downloaded_bytes;

    // A dismissed merge dialog skips the round without writing anything.
    assert!(world.set_probes([Reachable, Reachable, Reachable]).await);
    let report = world.orchestrator.sync_once().await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Skipped);
    assert!(world.store.has_pending().unwrap());
    assert!(world.service.pushes().is_empty());

    // The download resumed on its own and never went backwards.
    world.source.release(1_000);
    world.wait_status(id, DownloadStatus::Completed).await;
    let job = world.manager.get_download_status(id).unwrap();
    assert!(job.downloaded_bytes >= paused_at);
    assert_eq!(job.downloaded_bytes, job.total_bytes);
}

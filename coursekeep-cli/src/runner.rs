//! Shared setup for commands: configuration, logging, runtime and services.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coursekeep::clock::SystemClock;
use coursekeep::config::{config_file_path, ConfigFile};
use coursekeep::connectivity::{ConnectivityMonitor, MonitorConfig};
use coursekeep::download::{
    DownloadManager, DownloadManagerConfig, FsPackageStore, HttpCourseSource,
};
use coursekeep::logging::{init_logging, LoggingConfig, LoggingGuard};
use coursekeep::persistence::{DownloadHistory, JsonFileDownloadHistory, JsonFileStore, LocalStore};
use coursekeep::sync::{
    ConflictResolutionCoordinator, HttpProgressService, ProgressService, SyncOrchestrator,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::CliError;

/// Owns everything a command needs for its lifetime.
pub struct CliRunner {
    config: ConfigFile,
    runtime: Runtime,
    _logging: LoggingGuard,
}

impl CliRunner {
    /// Load configuration, start logging and build the runtime.
    pub fn new(verbose: bool) -> Result<Self, CliError> {
        let config = ConfigFile::load()?;

        let mut logging = LoggingConfig::from(&config);
        if verbose {
            logging.level = "debug".to_string();
        }
        logging.ansi = console::colors_enabled_stderr();
        let guard = init_logging(&logging)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("coursekeep-worker")
            .build()
            .map_err(|e| CliError::Runtime(e.to_string()))?;

        Ok(Self {
            config,
            runtime,
            _logging: guard,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            version = coursekeep::VERSION,
            command,
            config = %config_file_path().display(),
            service = %self.config.service.base_url,
            "coursekeep starting"
        );
    }

    /// Run a future to completion on the runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Spawn a task on the runtime.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Monitor using the route, HTTP ping and DNS probes.
    pub fn monitor(&self) -> Result<Arc<ConnectivityMonitor>, CliError> {
        let monitor = ConnectivityMonitor::with_default_probes(
            MonitorConfig::from(&self.config),
            &self.config.service.base_url,
        )?;
        Ok(Arc::new(monitor))
    }

    /// Start periodic checks on the runtime.
    pub fn start_monitoring(
        &self,
        monitor: &Arc<ConnectivityMonitor>,
        interval: Duration,
    ) -> Result<(), CliError> {
        let _enter = self.runtime.enter();
        monitor.start_monitoring(interval)?;
        Ok(())
    }

    /// The configured check interval.
    pub fn check_interval(&self) -> Duration {
        MonitorConfig::from(&self.config).check_interval
    }

    pub fn download_manager(
        &self,
        monitor: &Arc<ConnectivityMonitor>,
    ) -> Result<DownloadManager, CliError> {
        let downloads = &self.config.downloads;
        let source = HttpCourseSource::new(&self.config.service.base_url)
            .map_err(|e| CliError::Config(e.to_string()))?;
        let history = JsonFileDownloadHistory::open(&downloads.history_file, downloads.history_limit)?;

        let _enter = self.runtime.enter();
        let manager = DownloadManager::new(
            DownloadManagerConfig::from(&self.config),
            Arc::new(source),
            Arc::new(FsPackageStore::new(&downloads.directory)),
            Arc::new(history) as Arc<dyn DownloadHistory>,
            Arc::clone(monitor),
            Arc::new(SystemClock),
        )?;
        Ok(manager)
    }

    pub fn sync_orchestrator(
        &self,
        monitor: &Arc<ConnectivityMonitor>,
    ) -> Result<Arc<SyncOrchestrator>, CliError> {
        let store = JsonFileStore::open(&self.config.sync.store_path)?;
        let service = HttpProgressService::new(&self.config.service.base_url)?;
        Ok(Arc::new(SyncOrchestrator::new(
            Arc::clone(monitor),
            Arc::new(store) as Arc<dyn LocalStore>,
            Arc::new(service) as Arc<dyn ProgressService>,
            Arc::new(ConflictResolutionCoordinator::new()),
        )))
    }
}

/// Cancel `token` on the first Ctrl-C. A second Ctrl-C exits immediately.
pub fn cancel_on_ctrlc(token: CancellationToken) -> Result<(), CliError> {
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!();
        eprintln!("Interrupted, shutting down...");
        token.cancel();
    })
    .map_err(|e| CliError::Runtime(format!("failed to install Ctrl-C handler: {}", e)))
}

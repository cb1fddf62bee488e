//! Connectivity monitor service.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::probe::{ConnectivityProbe, DnsProbe, HttpPingProbe, ProbeFailure, RouteProbe};
use crate::clock::{SharedClock, SystemClock};
use crate::observer::{ListenerId, ListenerRegistry};

// =============================================================================
// Configuration
// =============================================================================

/// Default interval between monitoring cycles.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Hard timeout for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of agreeing probes needed to declare the network usable.
pub const DEFAULT_QUORUM: usize = 2;

/// Address consulted by the default route probe.
const DEFAULT_ROUTE_TARGET: &str = "1.1.1.1:53";

/// Configuration for the connectivity monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between monitoring cycles.
    pub check_interval: Duration,
    /// Hard timeout for each probe; a probe that exceeds it counts as unreachable.
    pub probe_timeout: Duration,
    /// Minimum number of probes that must report reachable.
    pub quorum: usize,
    /// Address used by the route probe.
    pub route_target: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            quorum: DEFAULT_QUORUM,
            route_target: DEFAULT_ROUTE_TARGET.to_string(),
        }
    }
}

// =============================================================================
// Status & reports
// =============================================================================

/// Aggregate connectivity verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStatus {
    /// Whether the last quorum evaluation declared the network usable.
    pub is_online: bool,
    /// When the last evaluation finished. `None` before the first check.
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Result of one probe within a check cycle.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Probe name.
    pub name: String,
    /// Whether the probe reported reachable. Failures and timeouts are `false`.
    pub reachable: bool,
    /// The absorbed failure, if any.
    pub failure: Option<ProbeFailure>,
    /// Time the probe took (bounded by the probe timeout).
    pub elapsed: Duration,
}

/// Detailed result of a check cycle.
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Per-probe results, in probe registration order.
    pub outcomes: Vec<ProbeOutcome>,
    /// Aggregate verdict.
    pub online: bool,
    /// Whether this cycle flipped the aggregate status.
    pub changed: bool,
}

impl CheckReport {
    /// Number of probes that reported reachable.
    pub fn reachable_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.reachable).count()
    }
}

/// Errors from monitor construction and lifecycle.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    /// A probe could not be constructed.
    #[error("failed to create probe: {0}")]
    Probe(#[from] ProbeFailure),

    /// Monitoring requires a Tokio runtime.
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(String),

    /// Invalid configuration.
    #[error("invalid connectivity configuration: {0}")]
    InvalidConfig(String),
}

/// Quorum rule: the network is usable when at least `quorum` probes agree.
///
/// A quorum of zero never passes.
pub fn quorum_reached(reachable: usize, quorum: usize) -> bool {
    quorum > 0 && reachable >= quorum
}

// =============================================================================
// Monitor
// =============================================================================

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically decides online/offline status from several probes.
///
/// The status starts offline and only changes as the result of a quorum
/// evaluation. Listeners are invoked synchronously, in registration order,
/// whenever the aggregate status flips.
pub struct ConnectivityMonitor {
    probes: Vec<Arc<dyn ConnectivityProbe>>,
    config: MonitorConfig,
    clock: SharedClock,
    status: RwLock<ConnectivityStatus>,
    listeners: ListenerRegistry<bool>,
    /// Serialises evaluations so status flips are published in order.
    evaluation: tokio::sync::Mutex<()>,
    task: Mutex<Option<MonitorTask>>,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("probes", &self.probes.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("config", &self.config)
            .field("status", &*self.status.read())
            .finish_non_exhaustive()
    }
}

impl ConnectivityMonitor {
    /// Create a monitor over an explicit set of probes.
    pub fn new(
        config: MonitorConfig,
        probes: Vec<Arc<dyn ConnectivityProbe>>,
        clock: SharedClock,
    ) -> Result<Self, ConnectivityError> {
        if config.quorum == 0 || config.quorum > probes.len() {
            return Err(ConnectivityError::InvalidConfig(format!(
                "quorum {} is not satisfiable with {} probes",
                config.quorum,
                probes.len()
            )));
        }

        Ok(Self {
            probes,
            config,
            clock,
            status: RwLock::new(ConnectivityStatus {
                is_online: false,
                last_checked_at: None,
            }),
            listeners: ListenerRegistry::new(),
            evaluation: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        })
    }

    /// Create a monitor with the standard route, HTTP ping and DNS probes.
    pub fn with_default_probes(
        config: MonitorConfig,
        service_base_url: &str,
    ) -> Result<Self, ConnectivityError> {
        let probes: Vec<Arc<dyn ConnectivityProbe>> = vec![
            Arc::new(RouteProbe::from_addr(&config.route_target)?),
            Arc::new(HttpPingProbe::new(service_base_url, config.probe_timeout)?),
            Arc::new(DnsProbe::from_base_url(service_base_url)?),
        ];
        Self::new(config, probes, Arc::new(SystemClock))
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectivityStatus {
        *self.status.read()
    }

    /// Shorthand for `status().is_online`.
    pub fn is_online(&self) -> bool {
        self.status.read().is_online
    }

    /// Register a status-change listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Remove a status-change listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Run one check cycle and return the aggregate verdict.
    pub async fn check_connection(&self) -> bool {
        self.check_connection_detailed().await.online
    }

    /// Run one check cycle and return per-probe detail.
    pub async fn check_connection_detailed(&self) -> CheckReport {
        let _evaluation = self.evaluation.lock().await;

        let outcomes = self.run_probes().await;
        let reachable = outcomes.iter().filter(|o| o.reachable).count();
        let online = quorum_reached(reachable, self.config.quorum);

        let previous = {
            let mut status = self.status.write();
            let previous = status.is_online;
            status.is_online = online;
            status.last_checked_at = Some(self.clock.now());
            previous
        };

        let changed = previous != online;
        if changed {
            info!(
                online,
                reachable,
                probes = self.probes.len(),
                "Connectivity status changed"
            );
            self.listeners.dispatch(&online);
        } else {
            debug!(online, reachable, "Connectivity unchanged");
        }

        CheckReport {
            outcomes,
            online,
            changed,
        }
    }

    async fn run_probes(&self) -> Vec<ProbeOutcome> {
        let timeout = self.config.probe_timeout;

        let runs = self.probes.iter().map(|probe| async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, probe.probe()).await {
                Ok(result) => result,
                Err(_) => Err(ProbeFailure::Timeout {
                    probe: probe.name().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };

            let (reachable, failure) = match result {
                Ok(reachable) => (reachable, None),
                Err(failure) => {
                    debug!(probe = probe.name(), error = %failure, "Probe failed");
                    (false, Some(failure))
                }
            };

            ProbeOutcome {
                name: probe.name().to_string(),
                reachable,
                failure,
                elapsed: started.elapsed(),
            }
        });

        join_all(runs).await
    }

    /// Start periodic monitoring. The first check runs immediately.
    ///
    /// Calling this while monitoring restarts the cycle with the new interval.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) -> Result<(), ConnectivityError> {
        if interval.is_zero() {
            return Err(ConnectivityError::InvalidConfig(
                "monitoring interval must be positive".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConnectivityError::NoRuntime(e.to_string()))?;

        self.stop_monitoring();

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let monitor = Arc::clone(self);

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = task_cancel.cancelled() => {
                        debug!("Connectivity monitoring cancelled");
                        break;
                    }

                    _ = ticker.tick() => {
                        monitor.check_connection().await;
                    }
                }
            }
        });

        *self.task.lock() = Some(MonitorTask { cancel, handle });
        info!(interval_ms = interval.as_millis() as u64, "Connectivity monitoring started");
        Ok(())
    }

    /// Stop periodic monitoring. Safe to call when not monitoring.
    pub fn stop_monitoring(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
            info!("Connectivity monitoring stopped");
        }
    }

    /// Whether a monitoring cycle is active.
    pub fn is_monitoring(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }
}

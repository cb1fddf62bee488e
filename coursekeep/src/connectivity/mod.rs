//! Quorum-based connectivity monitoring.
//!
//! A single reachability signal is unreliable: captive portals answer HTTP,
//! DNS can fail while routing works, and operating system flags go stale. The
//! monitor therefore runs several independent probes concurrently and only
//! declares the network usable when a quorum of them agree.
//!
//! # Architecture
//!
//! ```text
//! ConnectivityMonitor
//!         │
//!         ├── ConnectivityProbe (trait)
//!         │       ├── RouteProbe      (OS routing table has a path out)
//!         │       ├── HttpPingProbe   (HEAD <service>/ping, no-cache, 5s)
//!         │       └── DnsProbe        (resolver answers for the service host)
//!         │
//!         ├── quorum_reached()        (aggregate verdict)
//!         │
//!         └── ListenerRegistry<bool>  (status-change fan-out)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use coursekeep::connectivity::{ConnectivityMonitor, MonitorConfig};
//!
//! let monitor = Arc::new(ConnectivityMonitor::with_default_probes(
//!     MonitorConfig::default(),
//!     "https://courses.example.com/api",
//! )?);
//!
//! monitor.subscribe(|online: &bool| println!("online: {}", online));
//! monitor.start_monitoring(std::time::Duration::from_secs(30))?;
//! ```

mod monitor;
mod probe;

pub use monitor::{
    quorum_reached, CheckReport, ConnectivityError, ConnectivityMonitor, ConnectivityStatus,
    MonitorConfig, ProbeOutcome, DEFAULT_CHECK_INTERVAL, DEFAULT_PROBE_TIMEOUT, DEFAULT_QUORUM,
};
pub use probe::{
    ConnectivityProbe, DnsProbe, HttpPingProbe, ProbeBehaviour, ProbeFailure, ProbeFuture,
    RouteProbe, StaticProbe,
};

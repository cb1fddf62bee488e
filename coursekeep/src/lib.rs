//! Coursekeep - offline course client core
//!
//! This library lets a client keep working against a remote course service
//! while disconnected and reconcile local and remote state once the network
//! comes back. It is built from three cooperating services:
//!
//! - [`connectivity::ConnectivityMonitor`] decides whether the network is usable
//!   by running several independent probes and applying a quorum rule.
//! - [`download::DownloadManager`] runs course downloads as explicit state
//!   machines with pause/resume/cancel/retry and speed/ETA accounting, gated on
//!   the monitor's verdict.
//! - [`sync::ConflictResolutionCoordinator`] and [`sync::SyncOrchestrator`]
//!   detect offline edits that diverged from the server and apply a per-entity
//!   merge decision.
//!
//! Every service is constructed explicitly with its collaborators injected;
//! there is no global state.

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod download;
pub mod logging;
pub mod observer;
pub mod persistence;
pub mod sync;

/// Crate version, as reported by the CLI banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

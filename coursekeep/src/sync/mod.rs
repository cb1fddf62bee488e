//! Offline edit reconciliation.
//!
//! Progress recorded while offline is kept in a [`crate::persistence::LocalStore`]
//! with a pending flag and the server version it was based on. Once the
//! connectivity monitor reports online, the [`SyncOrchestrator`] compares
//! pending records with the server's copies:
//!
//! ```text
//!  LocalStore ──pending──► SyncOrchestrator ◄──fetch/push──► ProgressService
//!                               │      ▲
//!                     conflicts │      │ directive
//!                               ▼      │
//!                  ConflictResolutionCoordinator ◄── select / resolve all / apply / cancel
//! ```
//!
//! Records the server has not touched since their baseline are pushed
//! directly. Records where both sides moved become [`ConflictRecord`]s and go
//! through one coordinator session; each resolves to [`Side::Server`] unless
//! the user picks [`Side::Local`].

mod conflict;
mod detect;
mod error;
mod model;
mod orchestrator;
mod remote;

pub use conflict::{
    AbortReason, ConflictError, ConflictResolutionCoordinator, PendingResolution, PendingSession,
    SessionOpened,
};
pub use detect::{detect_divergence, is_divergent};
pub use error::{SyncError, SyncResult};
pub use model::{
    ConflictRecord, EntityKey, EntityType, LocalRecord, ProgressData, ResolutionDirective,
    ServerRecord, Side, VersionSnapshot,
};
pub use orchestrator::{AppliedResolution, SyncOrchestrator, SyncOutcome, SyncReport};
pub use remote::{HttpProgressService, MemoryProgressService, ProgressService, ServiceFuture};

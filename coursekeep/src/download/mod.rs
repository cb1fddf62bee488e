//! Course download lifecycle.
//!
//! Each download is a [`DownloadJob`] driven through a strict state machine
//! by the [`DownloadManager`]:
//!
//! ```text
//! queued → preparing → creating-package → downloading → [compressing] → completed
//!                                             ⇅
//!                                           paused
//! ```
//!
//! # Architecture
//!
//! ```text
//! DownloadManager
//!     │
//!     ├── JobRegistry           (jobs, workers, speed samples)
//!     ├── CourseSource (trait)  (manifest + ranged file streams)
//!     │       ├── HttpCourseSource
//!     │       └── MemoryCourseSource
//!     ├── PackageStore (trait)  (staging, checksums, packaging)
//!     │       ├── FsPackageStore
//!     │       └── MemoryPackageStore
//!     ├── DownloadHistory       (finished jobs across restarts)
//!     └── ListenerRegistry<DownloadEvent>
//! ```
//!
//! The manager subscribes to the [`crate::connectivity::ConnectivityMonitor`]:
//! jobs only leave `queued` while online, running transfers pause when the
//! network goes away and pick up where they stopped when it returns.
//!
//! # Example
//!
//! ```ignore
//! let manager = DownloadManager::new(
//!     DownloadManagerConfig::default(),
//!     Arc::new(HttpCourseSource::new("https://lms.example.com/api")?),
//!     Arc::new(FsPackageStore::new("/var/lib/coursekeep/downloads")),
//!     Arc::new(MemoryDownloadHistory::default()),
//!     monitor,
//!     Arc::new(SystemClock),
//! )?;
//!
//! manager.subscribe(|event| println!("{:?}", event));
//! let id = manager.download_course("rust-101", DownloadOptions::default())?;
//! ```

mod checksum;
mod error;
mod events;
mod http;
mod job;
mod manager;
mod progress;
mod registry;
mod source;
mod state;
mod store;

pub use checksum::{calculate_file_checksum, checksum_bytes, verify_checksum};
pub use error::{DownloadError, DownloadResult};
pub use events::{DownloadEvent, ProgressUpdate};
pub use http::HttpCourseSource;
pub use job::{CourseSummary, DownloadJob, DownloadOptions, FailureKind, JobFailure, JobId};
pub use manager::{
    DownloadManager, DownloadManagerConfig, DEFAULT_MAX_CONCURRENT, DEFAULT_OPERATION_TIMEOUT,
};
pub use progress::{
    estimate_eta, ProgressThrottle, SpeedTracker, DEFAULT_PROGRESS_INTERVAL, DEFAULT_SPEED_WINDOW,
};
pub use source::{
    ByteStream, CourseSource, DownloadPlan, MemoryCourseSource, PlannedFile, SourceFuture,
};
pub use state::{DownloadStatus, PauseReason};
pub use store::{
    FsPackageStore, MemoryPackageStore, PackageStore, StoreFuture, StoreStep, MANIFEST_FILE,
};

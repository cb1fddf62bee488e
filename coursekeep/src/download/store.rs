//! Local package storage.
//!
//! A job writes into a private staging package that is laid out during
//! `creating-package`, filled chunk by chunk while downloading, optionally
//! compressed, and finally promoted to its permanent location. Staging is
//! discarded when a job is cancelled or removed, and before every fresh
//! attempt.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::debug;

use super::checksum::{checksum_bytes, verify_checksum};
use super::job::{JobFailure, JobId};
use super::source::{DownloadPlan, PlannedFile, SourceFuture};

/// Boxed future returned by [`PackageStore`] methods.
pub type StoreFuture<'a, T> = SourceFuture<'a, T>;

/// Name of the manifest written into every package.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Destination for downloaded course content.
pub trait PackageStore: Send + Sync {
    /// Lay out the staging package for `job`.
    fn create_package<'a>(&'a self, job: JobId, plan: &'a DownloadPlan) -> StoreFuture<'a, ()>;

    /// Write `data` at `offset` within `file`.
    fn write_chunk<'a>(
        &'a self,
        job: JobId,
        file: &'a PlannedFile,
        offset: u64,
        data: Bytes,
    ) -> StoreFuture<'a, ()>;

    /// Seal `file` at `length` bytes and verify its checksum.
    fn finish_file<'a>(
        &'a self,
        job: JobId,
        file: &'a PlannedFile,
        length: u64,
    ) -> StoreFuture<'a, ()>;

    /// Package the downloaded files.
    fn compress<'a>(&'a self, job: JobId, plan: &'a DownloadPlan) -> StoreFuture<'a, ()>;

    /// Promote the staging package and return where it now lives.
    fn finalize<'a>(&'a self, job: JobId, plan: &'a DownloadPlan) -> StoreFuture<'a, PathBuf>;

    /// Release everything held for `job`. Safe to call more than once.
    fn discard(&self, job: JobId) -> StoreFuture<'_, ()>;
}

/// Map a manifest file name to a path that stays inside the package.
fn relative_path(name: &str) -> Result<PathBuf, JobFailure> {
    let path = Path::new(name);
    let safe = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if safe {
        Ok(path.to_path_buf())
    } else {
        Err(JobFailure::permanent(format!(
            "refusing to write outside the package: {}",
            name
        )))
    }
}

/// Directory name for a finished course.
fn package_dir_name(course_id: &str) -> String {
    course_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn disk_failure(context: &str, path: &Path, error: io::Error) -> JobFailure {
    JobFailure::permanent(format!("{} {}: {}", context, path.display(), error))
}

// =============================================================================
// Filesystem store
// =============================================================================

/// Stores packages under a root directory.
///
/// ```text
/// <root>/
///   .staging/job-<id>/   files being downloaded
///   <course-id>/         finished packages
/// ```
pub struct FsPackageStore {
    root: PathBuf,
    handles: tokio::sync::Mutex<HashMap<(JobId, String), tokio::fs::File>>,
}

impl FsPackageStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging directory of `job`.
    pub fn staging_dir(&self, job: JobId) -> PathBuf {
        self.root.join(".staging").join(format!("job-{}", job))
    }

    fn file_path(&self, job: JobId, name: &str) -> Result<PathBuf, JobFailure> {
        Ok(self.staging_dir(job).join(relative_path(name)?))
    }

    async fn close_handles(&self, job: JobId) {
        self.handles.lock().await.retain(|(owner, _), _| *owner != job);
    }
}

impl PackageStore for FsPackageStore {
    fn create_package<'a>(&'a self, job: JobId, plan: &'a DownloadPlan) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.staging_dir(job);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| disk_failure("failed to create", &dir, e))?;

            for file in &plan.files {
                relative_path(&file.name)?;
            }

            let manifest = serde_json::to_vec_pretty(plan)
                .map_err(|e| JobFailure::permanent(format!("failed to encode manifest: {}", e)))?;
            let manifest_path = dir.join(MANIFEST_FILE);
            tokio::fs::write(&manifest_path, manifest)
                .await
                .map_err(|e| disk_failure("failed to write", &manifest_path, e))?;

            debug!(job = %job, dir = %dir.display(), "Package staged");
            Ok(())
        })
    }

    fn write_chunk<'a>(
        &'a self,
        job: JobId,
        file: &'a PlannedFile,
        offset: u64,
        data: Bytes,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.file_path(job, &file.name)?;
            let mut handles = self.handles.lock().await;

            let handle = match handles.entry((job, file.name.clone())) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| disk_failure("failed to create", parent, e))?;
                    }
                    let opened = tokio::fs::OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(false)
                        .open(&path)
                        .await
                        .map_err(|e| disk_failure("failed to open", &path, e))?;
                    entry.insert(opened)
                }
            };

            handle
                .seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| disk_failure("failed to seek", &path, e))?;
            handle
                .write_all(&data)
                .await
                .map_err(|e| disk_failure("failed to write", &path, e))?;
            Ok(())
        })
    }

    fn finish_file<'a>(
        &'a self,
        job: JobId,
        file: &'a PlannedFile,
        length: u64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.file_path(job, &file.name)?;

            let handle = self.handles.lock().await.remove(&(job, file.name.clone()));
            match handle {
                Some(mut handle) => {
                    handle
                        .flush()
                        .await
                        .map_err(|e| disk_failure("failed to flush", &path, e))?;
                    handle
                        .set_len(length)
                        .await
                        .map_err(|e| disk_failure("failed to truncate", &path, e))?;
                    handle
                        .sync_all()
                        .await
                        .map_err(|e| disk_failure("failed to sync", &path, e))?;
                }
                None => {
                    // Empty files never see a chunk.
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| disk_failure("failed to create", parent, e))?;
                    }
                    let created = tokio::fs::OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(false)
                        .open(&path)
                        .await
                        .map_err(|e| disk_failure("failed to open", &path, e))?;
                    created
                        .set_len(length)
                        .await
                        .map_err(|e| disk_failure("failed to truncate", &path, e))?;
                }
            }

            if let Some(expected) = file.sha256.clone() {
                tokio::task::spawn_blocking(move || verify_checksum(&path, &expected))
                    .await
                    .map_err(|e| JobFailure::transient(format!("checksum task failed: {}", e)))??;
            }
            Ok(())
        })
    }

    fn compress<'a>(&'a self, job: JobId, plan: &'a DownloadPlan) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.close_handles(job).await;

            let paths = plan
                .files
                .iter()
                .map(|f| self.file_path(job, &f.name))
                .collect::<Result<Vec<_>, _>>()?;

            tokio::task::spawn_blocking(move || -> Result<(), JobFailure> {
                for path in paths {
                    gzip_in_place(&path)?;
                }
                Ok(())
            })
            .await
            .map_err(|e| JobFailure::transient(format!("compression task failed: {}", e)))?
        })
    }

    fn finalize<'a>(&'a self, job: JobId, plan: &'a DownloadPlan) -> StoreFuture<'a, PathBuf> {
        Box::pin(async move {
            self.close_handles(job).await;

            let staging = self.staging_dir(job);
            let target = self.root.join(package_dir_name(&plan.course.id));

            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&target)
                    .await
                    .map_err(|e| disk_failure("failed to replace", &target, e))?;
            }
            tokio::fs::rename(&staging, &target)
                .await
                .map_err(|e| disk_failure("failed to move package to", &target, e))?;

            debug!(job = %job, package = %target.display(), "Package finalized");
            Ok(target)
        })
    }

    fn discard(&self, job: JobId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.close_handles(job).await;

            let staging = self.staging_dir(job);
            match tokio::fs::remove_dir_all(&staging).await {
                Ok(()) => {
                    debug!(job = %job, "Staging package discarded");
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(disk_failure("failed to remove", &staging, e)),
            }
        })
    }
}

/// Replace `path` with `path.gz`.
fn gzip_in_place(path: &Path) -> Result<(), JobFailure> {
    let mut compressed_name = path.as_os_str().to_os_string();
    compressed_name.push(".gz");
    let compressed = PathBuf::from(compressed_name);

    let mut input =
        fs::File::open(path).map_err(|e| disk_failure("failed to open", path, e))?;
    let output =
        fs::File::create(&compressed).map_err(|e| disk_failure("failed to create", &compressed, e))?;

    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)
        .map_err(|e| disk_failure("failed to compress", path, e))?;
    encoder
        .finish()
        .map_err(|e| disk_failure("failed to compress", path, e))?;

    fs::remove_file(path).map_err(|e| disk_failure("failed to remove", path, e))
}

// =============================================================================
// In-memory store
// =============================================================================

/// Step of [`MemoryPackageStore`] that can be held open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreStep {
    /// Held after the package is staged.
    CreatePackage,
    /// Held before anything is compressed.
    Compress,
}

/// Keeps package content in memory.
#[derive(Debug, Default)]
pub struct MemoryPackageStore {
    files: Mutex<HashMap<(JobId, String), Vec<u8>>>,
    staged: Mutex<HashSet<JobId>>,
    compressed: Mutex<HashSet<JobId>>,
    finalized: Mutex<HashSet<JobId>>,
    discarded: Mutex<Vec<JobId>>,
    fail_writes: AtomicBool,
    held: Mutex<HashSet<StoreStep>>,
    released: Notify,
}

impl MemoryPackageStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail like a full disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Block every job at `step` until [`MemoryPackageStore::release`].
    pub fn hold(&self, step: StoreStep) {
        self.held.lock().insert(step);
    }

    /// Let jobs held at `step` carry on.
    pub fn release(&self, step: StoreStep) {
        self.held.lock().remove(&step);
        self.released.notify_waiters();
    }

    async fn pass(&self, step: StoreStep) {
        loop {
            let mut released = pin!(self.released.notified());
            released.as_mut().enable();
            if !self.held.lock().contains(&step) {
                return;
            }
            released.await;
        }
    }

    /// Bytes written so far for a file.
    pub fn file_content(&self, job: JobId, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(&(job, name.to_string())).cloned()
    }

    /// Whether `discard` released anything held for `job`.
    pub fn was_discarded(&self, job: JobId) -> bool {
        self.discarded.lock().contains(&job)
    }

    /// Whether a package is laid out for `job`.
    pub fn is_staged(&self, job: JobId) -> bool {
        self.staged.lock().contains(&job)
    }

    /// Whether `compress` ran for `job`.
    pub fn is_compressed(&self, job: JobId) -> bool {
        self.compressed.lock().contains(&job)
    }

    /// Whether `finalize` ran for `job`.
    pub fn is_finalized(&self, job: JobId) -> bool {
        self.finalized.lock().contains(&job)
    }
}

impl PackageStore for MemoryPackageStore {
    fn create_package<'a>(&'a self, job: JobId, plan: &'a DownloadPlan) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            for file in &plan.files {
                relative_path(&file.name)?;
            }
            self.staged.lock().insert(job);
            self.pass(StoreStep::CreatePackage).await;
            Ok(())
        })
    }

    fn write_chunk<'a>(
        &'a self,
        job: JobId,
        file: &'a PlannedFile,
        offset: u64,
        data: Bytes,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(JobFailure::permanent(format!(
                    "failed to write {}: no space left on device",
                    file.name
                )));
            }
            let mut files = self.files.lock();
            let content = files.entry((job, file.name.clone())).or_default();
            let offset = offset as usize;
            let end = offset + data.len();
            if content.len() < end {
                content.resize(end, 0);
            }
            content[offset..end].copy_from_slice(&data);
            Ok(())
        })
    }

    fn finish_file<'a>(
        &'a self,
        job: JobId,
        file: &'a PlannedFile,
        length: u64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut files = self.files.lock();
            let content = files.entry((job, file.name.clone())).or_default();
            content.resize(length as usize, 0);

            if let Some(expected) = &file.sha256 {
                let actual = checksum_bytes(content);
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(JobFailure::transient(format!(
                        "checksum mismatch for {}: expected {}, got {}",
                        file.name, expected, actual
                    )));
                }
            }
            Ok(())
        })
    }

    fn compress<'a>(&'a self, job: JobId, _plan: &'a DownloadPlan) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.pass(StoreStep::Compress).await;
            self.compressed.lock().insert(job);
            Ok(())
        })
    }

    fn finalize<'a>(&'a self, job: JobId, plan: &'a DownloadPlan) -> StoreFuture<'a, PathBuf> {
        Box::pin(async move {
            self.finalized.lock().insert(job);
            Ok(PathBuf::from(package_dir_name(&plan.course.id)))
        })
    }

    fn discard(&self, job: JobId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let had_files = {
                let mut files = self.files.lock();
                let before = files.len();
                files.retain(|(owner, _), _| *owner != job);
                files.len() != before
            };
            let was_staged = self.staged.lock().remove(&job);
            if had_files || was_staged {
                self.discarded.lock().push(job);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::job::{CourseSummary, FailureKind};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn plan(files: &[(&str, &[u8])]) -> DownloadPlan {
        DownloadPlan {
            course: CourseSummary {
                id: "course/42".into(),
                title: "Ownership".into(),
            },
            files: files
                .iter()
                .map(|(name, content)| PlannedFile {
                    name: name.to_string(),
                    url: format!("https://cdn.example/{}", name),
                    size: content.len() as u64,
                    sha256: Some(checksum_bytes(content)),
                })
                .collect(),
        }
    }

    #[test]
    fn test_relative_path_rejects_escapes() {
        assert!(relative_path("video/intro.mp4").is_ok());
        assert!(relative_path("../etc/passwd").is_err());
        assert!(relative_path("/etc/passwd").is_err());
        assert!(relative_path("").is_err());
    }

    #[test]
    fn test_package_dir_name_is_flat() {
        assert_eq!(package_dir_name("course/42"), "course_42");
        assert_eq!(package_dir_name("rust-101"), "rust-101");
    }

    #[tokio::test]
    async fn test_fs_store_full_cycle() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path());
        let plan = plan(&[("lesson/a.txt", b"hello world")]);
        let file = &plan.files[0];
        let job = JobId(1);

        store.create_package(job, &plan).await.unwrap();
        assert!(store.staging_dir(job).join(MANIFEST_FILE).exists());

        // Written out of order, the way a resumed transfer rewrites a tail.
        store
            .write_chunk(job, file, 6, Bytes::from_static(b"world"))
            .await
            .unwrap();
        store
            .write_chunk(job, file, 0, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        store.finish_file(job, file, 11).await.unwrap();

        let output = store.finalize(job, &plan).await.unwrap();
        assert_eq!(output, temp.path().join("course_42"));
        assert_eq!(
            fs::read(output.join("lesson/a.txt")).unwrap(),
            b"hello world"
        );
        assert!(!store.staging_dir(job).exists());
    }

    #[tokio::test]
    async fn test_fs_store_checksum_mismatch() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path());
        let plan = plan(&[("a.txt", b"expected")]);
        let job = JobId(2);

        store.create_package(job, &plan).await.unwrap();
        store
            .write_chunk(job, &plan.files[0], 0, Bytes::from_static(b"corrupt!"))
            .await
            .unwrap();
        let err = store.finish_file(job, &plan.files[0], 8).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_fs_store_compress() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path());
        let plan = plan(&[("a.txt", b"compress me")]);
        let job = JobId(3);

        store.create_package(job, &plan).await.unwrap();
        store
            .write_chunk(job, &plan.files[0], 0, Bytes::from_static(b"compress me"))
            .await
            .unwrap();
        store.finish_file(job, &plan.files[0], 11).await.unwrap();
        store.compress(job, &plan).await.unwrap();

        let staged = store.staging_dir(job);
        assert!(!staged.join("a.txt").exists());

        let mut decoded = String::new();
        GzDecoder::new(fs::File::open(staged.join("a.txt.gz")).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "compress me");
    }

    #[tokio::test]
    async fn test_fs_store_discard_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path());
        let plan = plan(&[("a.txt", b"x")]);
        let job = JobId(4);

        store.create_package(job, &plan).await.unwrap();
        store.discard(job).await.unwrap();
        assert!(!store.staging_dir(job).exists());
        store.discard(job).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_write_failure_is_permanent() {
        let store = MemoryPackageStore::new();
        let plan = plan(&[("a.txt", b"x")]);
        store.set_fail_writes(true);

        let err = store
            .write_chunk(JobId(1), &plan.files[0], 0, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }
}

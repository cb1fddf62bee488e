//! Where course content comes from.
//!
//! The manager only talks to a [`CourseSource`]; [`super::HttpCourseSource`]
//! is the production implementation and [`MemoryCourseSource`] a scriptable
//! in-process one.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::job::{CourseSummary, DownloadOptions, JobFailure};

/// Chunked file content.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, JobFailure>> + Send>>;

/// Boxed future returned by [`CourseSource`] methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, JobFailure>> + Send + 'a>>;

/// One file to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    /// Relative path inside the package.
    pub name: String,
    /// Location on the remote service.
    pub url: String,
    /// Size in bytes; 0 when unknown.
    #[serde(default)]
    pub size: u64,
    /// Expected SHA-256, lowercase hex.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Everything a job needs to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPlan {
    pub course: CourseSummary,
    pub files: Vec<PlannedFile>,
}

impl DownloadPlan {
    /// Sum of known file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Remote course content.
pub trait CourseSource: Send + Sync {
    /// Resolve the files that make up `target_entity_id`.
    ///
    /// Fails permanently when the target no longer exists.
    fn plan<'a>(
        &'a self,
        target_entity_id: &'a str,
        options: &'a DownloadOptions,
    ) -> SourceFuture<'a, DownloadPlan>;

    /// Stream `file` starting at byte `offset`.
    fn open<'a>(&'a self, file: &'a PlannedFile, offset: u64) -> SourceFuture<'a, ByteStream>;
}

// =============================================================================
// In-memory source
// =============================================================================

#[derive(Debug, Clone)]
struct MemoryCourse {
    course: CourseSummary,
    files: Vec<(PlannedFile, Bytes)>,
}

#[derive(Debug, Default)]
struct MemoryScript {
    /// Fail the next `open` of the named file, transiently.
    fail_open: HashMap<String, usize>,
    /// Fail every `plan` with a transient error.
    fail_plan: bool,
}

/// In-process course source.
///
/// Content is served in fixed-size chunks. When gated, every chunk waits for
/// a permit from [`MemoryCourseSource::release`], which lets callers observe
/// a transfer mid-flight.
#[derive(Debug, Clone)]
pub struct MemoryCourseSource {
    courses: Arc<Mutex<HashMap<String, MemoryCourse>>>,
    script: Arc<Mutex<MemoryScript>>,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
}

impl MemoryCourseSource {
    /// Ungated source that serves chunks of `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            courses: Arc::new(Mutex::new(HashMap::new())),
            script: Arc::new(Mutex::new(MemoryScript::default())),
            chunk_size: chunk_size.max(1),
            gate: None,
        }
    }

    /// Source whose chunks are released one permit at a time.
    pub fn gated(chunk_size: usize) -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new(chunk_size)
        }
    }

    /// Publish a course made of `(name, content)` files.
    pub fn add_course(&self, id: &str, title: &str, files: Vec<(&str, Vec<u8>)>) {
        let files = files
            .into_iter()
            .map(|(name, content)| {
                let file = PlannedFile {
                    name: name.to_string(),
                    url: format!("memory://{}/{}", id, name),
                    size: content.len() as u64,
                    sha256: Some(super::checksum::checksum_bytes(&content)),
                };
                (file, Bytes::from(content))
            })
            .collect();

        self.courses.lock().insert(
            id.to_string(),
            MemoryCourse {
                course: CourseSummary {
                    id: id.to_string(),
                    title: title.to_string(),
                },
                files,
            },
        );
    }

    /// Remove a course; later plans for it fail permanently.
    pub fn remove_course(&self, id: &str) {
        self.courses.lock().remove(id);
    }

    /// Let `chunks` more chunks through a gated source.
    pub fn release(&self, chunks: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(chunks);
        }
    }

    /// Fail the next `times` opens of `file_name` with a transient error.
    pub fn fail_next_open(&self, file_name: &str, times: usize) {
        self.script
            .lock()
            .fail_open
            .insert(file_name.to_string(), times);
    }

    /// Make every plan fail transiently until cleared.
    pub fn set_fail_plan(&self, fail: bool) {
        self.script.lock().fail_plan = fail;
    }

    fn content(&self, file: &PlannedFile) -> Option<Bytes> {
        let courses = self.courses.lock();
        courses
            .values()
            .flat_map(|c| c.files.iter())
            .find(|(f, _)| f.url == file.url)
            .map(|(_, content)| content.clone())
    }
}

impl CourseSource for MemoryCourseSource {
    fn plan<'a>(
        &'a self,
        target_entity_id: &'a str,
        _options: &'a DownloadOptions,
    ) -> SourceFuture<'a, DownloadPlan> {
        Box::pin(async move {
            if self.script.lock().fail_plan {
                return Err(JobFailure::transient("scripted manifest failure"));
            }
            let courses = self.courses.lock();
            let course = courses.get(target_entity_id).ok_or_else(|| {
                JobFailure::permanent(format!("course {} no longer exists", target_entity_id))
            })?;
            Ok(DownloadPlan {
                course: course.course.clone(),
                files: course.files.iter().map(|(f, _)| f.clone()).collect(),
            })
        })
    }

    fn open<'a>(&'a self, file: &'a PlannedFile, offset: u64) -> SourceFuture<'a, ByteStream> {
        Box::pin(async move {
            {
                let mut script = self.script.lock();
                if let Some(remaining) = script.fail_open.get_mut(&file.name) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(JobFailure::transient(format!(
                            "connection reset while opening {}",
                            file.name
                        )));
                    }
                }
            }

            let content = self
                .content(file)
                .ok_or_else(|| JobFailure::permanent(format!("{} not found", file.name)))?;
            let start = (offset as usize).min(content.len());
            let chunk_size = self.chunk_size;
            let gate = self.gate.clone();

            let chunks = stream::unfold(start, move |position| {
                let content = content.clone();
                let gate = gate.clone();
                async move {
                    if position >= content.len() {
                        return None;
                    }
                    if let Some(gate) = gate {
                        match gate.acquire().await {
                            Ok(permit) => permit.forget(),
                            Err(_) => return None,
                        }
                    }
                    let end = (position + chunk_size).min(content.len());
                    Some((Ok(content.slice(position..end)), end))
                }
            });

            Ok(Box::pin(chunks) as ByteStream)
        })
    }
}

//! HTTP course source with ranged resume.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderValue, RANGE};
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use super::job::{DownloadOptions, JobFailure};
use super::source::{ByteStream, CourseSource, DownloadPlan, PlannedFile, SourceFuture};

/// Default connect timeout for HTTP requests.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches manifests and files from the course service.
///
/// Manifests live at `<base>/courses/<id>/download-manifest`; file URLs in a
/// manifest may be absolute or relative to the base.
#[derive(Debug, Clone)]
pub struct HttpCourseSource {
    client: Client,
    base_url: Url,
}

impl HttpCourseSource {
    /// Create a source for the service rooted at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, JobFailure> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| JobFailure::permanent(format!("failed to create HTTP client: {}", e)))?;
        Self::with_client(client, base_url)
    }

    /// Create a source with a preconfigured client.
    pub fn with_client(client: Client, base_url: &str) -> Result<Self, JobFailure> {
        // A trailing slash makes relative joins append instead of replace.
        let normalised = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalised)
            .map_err(|e| JobFailure::permanent(format!("invalid base URL {}: {}", base_url, e)))?;
        Ok(Self { client, base_url })
    }

    fn manifest_url(&self, target_entity_id: &str) -> Result<Url, JobFailure> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| JobFailure::permanent("base URL cannot have path segments"))?
            .pop_if_empty()
            .extend(["courses", target_entity_id, "download-manifest"]);
        Ok(url)
    }

    fn file_url(&self, file: &PlannedFile) -> Result<Url, JobFailure> {
        self.base_url
            .join(&file.url)
            .map_err(|e| JobFailure::permanent(format!("invalid file URL {}: {}", file.url, e)))
    }
}

/// Classify an unsuccessful HTTP status.
fn status_failure(status: StatusCode, what: &str) -> JobFailure {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            JobFailure::permanent(format!("{} no longer exists ({})", what, status))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            JobFailure::transient(format!("{} temporarily unavailable ({})", what, status))
        }
        s if s.is_server_error() => {
            JobFailure::transient(format!("server error fetching {} ({})", what, status))
        }
        _ => JobFailure::permanent(format!("request for {} rejected ({})", what, status)),
    }
}

fn network_failure(error: reqwest::Error) -> JobFailure {
    JobFailure::transient(format!("network error: {}", error))
}

/// Drop the first `skip` bytes of a stream.
fn skip_bytes(inner: ByteStream, skip: u64) -> ByteStream {
    let skipped = stream::unfold((inner, skip), |(mut inner, mut skip)| async move {
        loop {
            let chunk = match inner.next().await? {
                Ok(chunk) => chunk,
                Err(e) => return Some((Err(e), (inner, skip))),
            };
            if skip == 0 {
                return Some((Ok(chunk), (inner, 0)));
            }
            let len = chunk.len() as u64;
            if len <= skip {
                skip -= len;
                continue;
            }
            let rest = chunk.slice(skip as usize..);
            return Some((Ok(rest), (inner, 0)));
        }
    });
    Box::pin(skipped)
}

impl CourseSource for HttpCourseSource {
    fn plan<'a>(
        &'a self,
        target_entity_id: &'a str,
        options: &'a DownloadOptions,
    ) -> SourceFuture<'a, DownloadPlan> {
        Box::pin(async move {
            let url = self.manifest_url(target_entity_id)?;
            let mut request = self.client.get(url.clone());
            if !options.extra.is_empty() {
                let params: Vec<(String, String)> = options
                    .extra
                    .iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => (k.clone(), s.clone()),
                        other => (k.clone(), other.to_string()),
                    })
                    .collect();
                request = request.query(&params);
            }

            let response = request.send().await.map_err(network_failure)?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_failure(status, &format!("course {}", target_entity_id)));
            }

            let plan: DownloadPlan = response.json().await.map_err(|e| {
                if e.is_decode() {
                    JobFailure::permanent(format!("malformed manifest for {}: {}", target_entity_id, e))
                } else {
                    network_failure(e)
                }
            })?;
            debug!(
                course = %target_entity_id,
                files = plan.files.len(),
                total_bytes = plan.total_bytes(),
                "Manifest resolved"
            );
            Ok(plan)
        })
    }

    fn open<'a>(&'a self, file: &'a PlannedFile, offset: u64) -> SourceFuture<'a, ByteStream> {
        Box::pin(async move {
            let url = self.file_url(file)?;
            let mut request = self.client.get(url);
            if offset > 0 {
                let range = HeaderValue::from_str(&format!("bytes={}-", offset))
                    .map_err(|e| JobFailure::permanent(e.to_string()))?;
                request = request.header(RANGE, range);
            }

            let response = request.send().await.map_err(network_failure)?;
            let status = response.status();

            if status == StatusCode::RANGE_NOT_SATISFIABLE && file.size > 0 && offset >= file.size {
                // Nothing left to fetch.
                return Ok(Box::pin(stream::empty()) as ByteStream);
            }
            if !status.is_success() {
                return Err(status_failure(status, &file.name));
            }

            let body: ByteStream = Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(network_failure)),
            );

            if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
                debug!(file = %file.name, offset, "Server ignored range, skipping prefix");
                return Ok(skip_bytes(body, offset));
            }
            Ok(body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::download::job::FailureKind;

    #[test]
    fn test_manifest_url() {
        let source = HttpCourseSource::new("https://lms.example.com/api/").unwrap();
        assert_eq!(
            source.manifest_url("c 1").unwrap().as_str(),
            "https://lms.example.com/api/courses/c%201/download-manifest"
        );
    }

    #[test]
    fn test_relative_file_urls_join_base() {
        let source = HttpCourseSource::new("https://lms.example.com/api").unwrap();
        let file = PlannedFile {
            name: "a.mp4".into(),
            url: "files/a.mp4".into(),
            size: 0,
            sha256: None,
        };
        assert_eq!(
            source.file_url(&file).unwrap().as_str(),
            "https://lms.example.com/api/files/a.mp4"
        );

        let absolute = PlannedFile {
            url: "https://cdn.example.com/a.mp4".into(),
            ..file
        };
        assert_eq!(
            source.file_url(&absolute).unwrap().as_str(),
            "https://cdn.example.com/a.mp4"
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            status_failure(StatusCode::NOT_FOUND, "x").kind,
            FailureKind::Permanent
        );
        assert_eq!(
            status_failure(StatusCode::FORBIDDEN, "x").kind,
            FailureKind::Permanent
        );
        assert_eq!(
            status_failure(StatusCode::BAD_GATEWAY, "x").kind,
            FailureKind::Transient
        );
        assert_eq!(
            status_failure(StatusCode::TOO_MANY_REQUESTS, "x").kind,
            FailureKind::Transient
        );
    }

    #[tokio::test]
    async fn test_skip_bytes_across_chunks() {
        let chunks: Vec<Result<Bytes, JobFailure>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
            Ok(Bytes::from_static(b"gh")),
        ];
        let inner: ByteStream = Box::pin(stream::iter(chunks));

        let out: Vec<u8> = skip_bytes(inner, 4)
            .map(|c| c.unwrap().to_vec())
            .concat()
            .await;
        assert_eq!(out, b"efgh");
    }
}

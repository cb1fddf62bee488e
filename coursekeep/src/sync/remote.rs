//! Remote progress service.
//!
//! The orchestrator reads the server's copy of entities and pushes local
//! winners through a [`ProgressService`]. [`HttpProgressService`] speaks the
//! course service's JSON API; [`MemoryProgressService`] is an in-process
//! stand-in.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use tracing::debug;

use super::error::{SyncError, SyncResult};
use super::model::{EntityKey, ServerRecord, VersionSnapshot};

/// Boxed future returned by [`ProgressService`] methods.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = SyncResult<T>> + Send + 'a>>;

/// Server-side progress records.
pub trait ProgressService: Send + Sync {
    /// Current server copies of `keys`. Entities the server does not know
    /// are left out.
    fn fetch<'a>(&'a self, keys: &'a [EntityKey]) -> ServiceFuture<'a, Vec<ServerRecord>>;

    /// Replace the server copy of `key`. Returns the version the server now
    /// holds.
    fn push<'a>(
        &'a self,
        key: &'a EntityKey,
        snapshot: &'a VersionSnapshot,
    ) -> ServiceFuture<'a, VersionSnapshot>;
}

// =============================================================================
// HTTP service
// =============================================================================

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct FetchQuery {
    keys: String,
}

/// Progress API of the course service.
///
/// - `GET <base>/progress?keys=lesson:1,quiz:2` returns a JSON array of
///   server records.
/// - `PUT <base>/progress/<type>/<id>` with a version snapshot body returns
///   the stored snapshot.
#[derive(Debug, Clone)]
pub struct HttpProgressService {
    client: Client,
    base_url: Url,
}

impl HttpProgressService {
    pub fn new(base_url: &str) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Network(format!("failed to create HTTP client: {}", e)))?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> SyncResult<Self> {
        let normalised = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalised).map_err(|e| SyncError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "URL cannot have path segments".to_string(),
            });
        }
        Ok(Self { client, base_url })
    }

    fn url(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidBaseUrl {
                url: self.base_url.to_string(),
                reason: "URL cannot have path segments".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn network_error(error: reqwest::Error) -> SyncError {
    if error.is_decode() {
        SyncError::Decode(error.to_string())
    } else {
        SyncError::Network(error.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SyncError::Rejected {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.canonical_reason().unwrap_or("unknown").to_string()
        } else {
            message
        },
    })
}

impl ProgressService for HttpProgressService {
    fn fetch<'a>(&'a self, keys: &'a [EntityKey]) -> ServiceFuture<'a, Vec<ServerRecord>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let query = FetchQuery {
                keys: keys
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            };
            let response = self
                .client
                .get(self.url(&["progress"])?)
                .query(&query)
                .send()
                .await
                .map_err(network_error)?;
            let records: Vec<ServerRecord> = check_status(response)
                .await?
                .json()
                .await
                .map_err(network_error)?;
            debug!(requested = keys.len(), received = records.len(), "Fetched server progress");
            Ok(records)
        })
    }

    fn push<'a>(
        &'a self,
        key: &'a EntityKey,
        snapshot: &'a VersionSnapshot,
    ) -> ServiceFuture<'a, VersionSnapshot> {
        Box::pin(async move {
            let url = self.url(&["progress", key.entity_type.as_str(), key.entity_id.as_str()])?;
            let response = self
                .client
                .put(url)
                .json(snapshot)
                .send()
                .await
                .map_err(network_error)?;
            if response.status() == StatusCode::NO_CONTENT {
                return Ok(snapshot.clone());
            }
            let stored = check_status(response)
                .await?
                .json()
                .await
                .map_err(network_error)?;
            debug!(entity = %key, "Pushed local progress");
            Ok(stored)
        })
    }
}

// =============================================================================
// In-memory service
// =============================================================================

#[derive(Debug, Default)]
struct MemoryServiceState {
    records: HashMap<EntityKey, VersionSnapshot>,
    pushes: Vec<EntityKey>,
    unreachable: bool,
}

/// In-process progress service.
#[derive(Debug, Default)]
pub struct MemoryProgressService {
    state: Mutex<MemoryServiceState>,
}

impl MemoryProgressService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server copy of `key`.
    pub fn set_record(&self, key: EntityKey, snapshot: VersionSnapshot) {
        self.state.lock().records.insert(key, snapshot);
    }

    pub fn record(&self, key: &EntityKey) -> Option<VersionSnapshot> {
        self.state.lock().records.get(key).cloned()
    }

    /// Keys pushed so far, in order.
    pub fn pushes(&self) -> Vec<EntityKey> {
        self.state.lock().pushes.clone()
    }

    /// Make every call fail with a network error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }
}

impl ProgressService for MemoryProgressService {
    fn fetch<'a>(&'a self, keys: &'a [EntityKey]) -> ServiceFuture<'a, Vec<ServerRecord>> {
        Box::pin(async move {
            let state = self.state.lock();
            if state.unreachable {
                return Err(SyncError::Network("service unreachable".to_string()));
            }
            Ok(keys
                .iter()
                .filter_map(|key| {
                    state.records.get(key).map(|snapshot| ServerRecord {
                        key: key.clone(),
                        snapshot: snapshot.clone(),
                    })
                })
                .collect())
        })
    }

    fn push<'a>(
        &'a self,
        key: &'a EntityKey,
        snapshot: &'a VersionSnapshot,
    ) -> ServiceFuture<'a, VersionSnapshot> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.unreachable {
                return Err(SyncError::Network("service unreachable".to_string()));
            }
            state.records.insert(key.clone(), snapshot.clone());
            state.pushes.push(key.clone());
            Ok(snapshot.clone())
        })
    }
}

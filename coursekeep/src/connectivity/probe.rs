//! Pluggable reachability probes.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Boxed future returned by [`ConnectivityProbe::probe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, ProbeFailure>> + Send + 'a>>;

/// A single probe failed. Absorbed by the monitor and counted as unreachable.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeFailure {
    /// The probe did not answer within the hard timeout.
    #[error("probe {probe} timed out after {timeout_ms}ms")]
    Timeout { probe: String, timeout_ms: u64 },

    /// Network-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The probe target could not be interpreted.
    #[error("invalid probe target: {0}")]
    InvalidTarget(String),
}

/// An independent reachability signal.
///
/// Uses a boxed future so probes can be stored as trait objects.
pub trait ConnectivityProbe: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    /// Returns `Ok(true)` when this signal considers the network usable.
    fn probe(&self) -> ProbeFuture<'_>;
}

// =============================================================================
// OS-level route probe
// =============================================================================

/// Asks the operating system whether it has a route to an outside address.
///
/// Connecting a UDP socket sends no packets; it only consults the routing
/// table, so this is cheap and works without any server cooperation.
#[derive(Debug, Clone)]
pub struct RouteProbe {
    target: SocketAddr,
}

impl RouteProbe {
    /// Create a probe that checks for a route to `target`.
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }

    /// Parse the target from a `host:port` string.
    pub fn from_addr(addr: &str) -> Result<Self, ProbeFailure> {
        addr.parse()
            .map(Self::new)
            .map_err(|_| ProbeFailure::InvalidTarget(addr.to_string()))
    }
}

impl ConnectivityProbe for RouteProbe {
    fn name(&self) -> &str {
        "route"
    }

    fn probe(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            let bind = if self.target.is_ipv4() {
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
            } else {
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
            };
            let socket = UdpSocket::bind(bind)
                .await
                .map_err(|e| ProbeFailure::Network(e.to_string()))?;
            socket
                .connect(self.target)
                .await
                .map_err(|e| ProbeFailure::Network(e.to_string()))?;

            let local = socket
                .local_addr()
                .map_err(|e| ProbeFailure::Network(e.to_string()))?;
            Ok(!local.ip().is_loopback() && !local.ip().is_unspecified())
        })
    }
}

// =============================================================================
// Application-level HTTP liveness probe
// =============================================================================

/// Sends `HEAD <base>/ping` to the course service.
///
/// Every request carries a unique query parameter and no-cache headers so an
/// intermediate cache or captive portal cannot answer on the server's behalf.
#[derive(Debug, Clone)]
pub struct HttpPingProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpPingProbe {
    /// Create a probe for the service rooted at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProbeFailure> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeFailure::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: ping_url(base_url),
        })
    }

    /// The ping endpoint, without the cache-busting parameter.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Build `<base>/ping`, tolerating a trailing slash on the base.
fn ping_url(base_url: &str) -> String {
    format!("{}/ping", base_url.trim_end_matches('/'))
}

fn cache_buster() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

impl ConnectivityProbe for HttpPingProbe {
    fn name(&self) -> &str {
        "http-ping"
    }

    fn probe(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            let response = self
                .client
                .head(&self.url)
                .query(&[("_", cache_buster().to_string())])
                .header(CACHE_CONTROL, "no-cache, no-store")
                .header(PRAGMA, "no-cache")
                .send()
                .await
                .map_err(|e| ProbeFailure::Network(e.to_string()))?;

            Ok(response.status().is_success())
        })
    }
}

// =============================================================================
// Resolver probe
// =============================================================================

/// Resolves the service host through the system resolver.
#[derive(Debug, Clone)]
pub struct DnsProbe {
    host_port: String,
}

impl DnsProbe {
    /// Create a probe for the host of `base_url`.
    pub fn from_base_url(base_url: &str) -> Result<Self, ProbeFailure> {
        let url = reqwest::Url::parse(base_url)
            .map_err(|_| ProbeFailure::InvalidTarget(base_url.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProbeFailure::InvalidTarget(base_url.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(80);

        Ok(Self {
            host_port: format!("{}:{}", host, port),
        })
    }
}

impl ConnectivityProbe for DnsProbe {
    fn name(&self) -> &str {
        "dns"
    }

    fn probe(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            let mut addrs = tokio::net::lookup_host(self.host_port.as_str())
                .await
                .map_err(|e| ProbeFailure::Network(e.to_string()))?;
            Ok(addrs.next().is_some())
        })
    }
}

// =============================================================================
// Scripted probe
// =============================================================================

/// What a [`StaticProbe`] reports on its next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBehaviour {
    /// Report reachable.
    Reachable,
    /// Report unreachable.
    Unreachable,
    /// Fail with a network error.
    Fail,
    /// Never answer (exercises the monitor's hard timeout).
    Hang,
}

/// Probe with a scripted answer, for tests and offline simulation.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    name: String,
    behaviour: Arc<Mutex<ProbeBehaviour>>,
}

impl StaticProbe {
    /// Create a probe with an initial behaviour.
    pub fn new(name: impl Into<String>, behaviour: ProbeBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour: Arc::new(Mutex::new(behaviour)),
        }
    }

    /// Change what the probe reports from now on. Clones share the script.
    pub fn set(&self, behaviour: ProbeBehaviour) {
        *self.behaviour.lock() = behaviour;
    }
}

impl ConnectivityProbe for StaticProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> ProbeFuture<'_> {
        let behaviour = *self.behaviour.lock();
        Box::pin(async move {
            match behaviour {
                ProbeBehaviour::Reachable => Ok(true),
                ProbeBehaviour::Unreachable => Ok(false),
                ProbeBehaviour::Fail => Err(ProbeFailure::Network("scripted failure".into())),
                ProbeBehaviour::Hang => {
                    futures::future::pending::<()>().await;
                    Ok(false)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_url_trims_trailing_slash() {
        assert_eq!(ping_url("https://a.example/api/"), "https://a.example/api/ping");
        assert_eq!(ping_url("https://a.example/api"), "https://a.example/api/ping");
    }

    #[test]
    fn test_dns_probe_from_base_url() {
        let probe = DnsProbe::from_base_url("https://courses.example.com/api").unwrap();
        assert_eq!(probe.host_port, "courses.example.com:443");

        let probe = DnsProbe::from_base_url("http://localhost:8080").unwrap();
        assert_eq!(probe.host_port, "localhost:8080");

        assert!(DnsProbe::from_base_url("not a url").is_err());
    }

    #[test]
    fn test_route_probe_rejects_bad_address() {
        assert!(matches!(
            RouteProbe::from_addr("nowhere"),
            Err(ProbeFailure::InvalidTarget(_))
        ));
        assert!(RouteProbe::from_addr("1.1.1.1:53").is_ok());
    }

    #[test]
    fn test_cache_buster_changes() {
        let a = cache_buster();
        std::thread::sleep(Duration::from_millis(1));
        assert_ne!(a, cache_buster());
    }

    #[tokio::test]
    async fn test_static_probe_script() {
        let probe = StaticProbe::new("scripted", ProbeBehaviour::Reachable);
        assert_eq!(probe.probe().await, Ok(true));

        probe.set(ProbeBehaviour::Unreachable);
        assert_eq!(probe.probe().await, Ok(false));

        probe.set(ProbeBehaviour::Fail);
        assert!(probe.probe().await.is_err());
    }
}

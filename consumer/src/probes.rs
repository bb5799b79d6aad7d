//! `reqwest`-backed implementations of the gateway-core `HealthProbe` and
//! `MetricsFetcher` traits, polling each backend's liveness and `/metrics`
//! endpoints over plain HTTP.

use gateway_core::{Backend, HealthProbe, MetricsFetcher, PING_TIMEOUT};

/// Probes `GET {backend}/v1/models`; healthy iff the response is 2xx
/// within [`PING_TIMEOUT`].
pub struct ReqwestHealthProbe {
    client: reqwest::Client,
}

impl ReqwestHealthProbe {
    /// Build a probe with a client timeout fixed at [`PING_TIMEOUT`].
    pub fn new() -> Self {
        Self { client: reqwest::Client::builder().timeout(PING_TIMEOUT).build().unwrap_or_default() }
    }
}

impl Default for ReqwestHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HealthProbe for ReqwestHealthProbe {
    async fn is_healthy(&self, backend: &Backend) -> bool {
        let url = format!("{}/v1/models", backend.url.trim_end_matches('/'));
        let mut request = self.client.get(&url);
        if let Some(auth) = backend.authorization_header() {
            request = request.header("Authorization", auth);
        }
        matches!(request.send().await, Ok(response) if response.status().is_success())
    }
}

/// Fetches `GET {backend}/metrics` raw exposition text.
pub struct ReqwestMetricsFetcher {
    client: reqwest::Client,
}

impl ReqwestMetricsFetcher {
    /// Build a fetcher using `reqwest`'s default transport timeout. This is
    /// independent of how often the tracker refreshes — a slow `/metrics`
    /// response shouldn't be bounded by the poll interval.
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for ReqwestMetricsFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetricsFetcher for ReqwestMetricsFetcher {
    async fn fetch(&self, backend_url: &str) -> Option<String> {
        let url = format!("{}/metrics", backend_url.trim_end_matches('/'));
        let response = self.client.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }
}

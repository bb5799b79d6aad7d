//! ServerPinger — periodic liveness checks that publish the healthy
//! backend subset to the active selection strategy.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::oneshot;
use tokio::time::interval;

use crate::backend::Backend;

/// Probes one backend's health. Implemented by `reqwest` (`GET
/// /v1/models`, healthy iff 2xx) in the `consumer` binary; abstracted so the
/// pinger's fan-out/update logic is testable without a network dependency.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// Returns `true` iff the backend answered with a successful status
    /// within the per-request timeout.
    async fn is_healthy(&self, backend: &Backend) -> bool;
}

/// Receives the healthy subset on every ping tick. Implemented by each
/// [`crate::strategy::SelectionStrategy`] (`update_servers`).
pub trait HealthSink: Send + Sync + 'static {
    /// Replace the active backend set. Implementations should no-op if the
    /// list is unchanged (see §4.5 `UpdateServers`).
    fn update_servers(&self, healthy: Vec<Backend>);
}

/// Shared, lock-free view of the last-known healthy set, useful when a
/// consumer needs read access to "currently healthy backends" outside of
/// the strategy itself (e.g. for the private-queue handler's restricted
/// pool).
#[derive(Clone, Default)]
pub struct HealthyBackends(Arc<ArcSwap<Vec<Backend>>>);

impl HealthyBackends {
    /// An empty healthy set.
    pub fn new() -> Self {
        Self(Arc::new(ArcSwap::from_pointee(Vec::new())))
    }

    /// The current healthy set.
    pub fn get(&self) -> Arc<Vec<Backend>> {
        self.0.load_full()
    }
}

impl HealthSink for HealthyBackends {
    fn update_servers(&self, healthy: Vec<Backend>) {
        self.0.store(Arc::new(healthy));
    }
}

/// Per-request timeout for a single health probe.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Fans out concurrent health checks to every registered backend on a fixed
/// interval and publishes the healthy subset (preserving registry order) to
/// one or more sinks.
pub struct ServerPinger<P: HealthProbe> {
    probe: Arc<P>,
    backends: Vec<Backend>,
    refresh_rate: Duration,
}

impl<P: HealthProbe> ServerPinger<P> {
    /// Build a pinger over the given backend list.
    pub fn new(probe: Arc<P>, backends: Vec<Backend>, refresh_rate: Duration) -> Self {
        Self { probe, backends, refresh_rate }
    }

    /// Run one health-check pass over every backend, preserving registry
    /// order in the returned healthy subset.
    pub async fn check_once(&self) -> Vec<Backend> {
        let checks = self.backends.iter().map(|b| {
            let probe = Arc::clone(&self.probe);
            let backend = b.clone();
            async move { probe.is_healthy(&backend).await.then_some(backend) }
        });
        let results = futures::future::join_all(checks).await;
        results.into_iter().flatten().collect()
    }

    /// Spawn the periodic pinger loop, publishing to `sink` on every tick.
    /// Returns a shutdown handle pairing a oneshot sender with the task's
    /// `JoinHandle`.
    pub fn spawn<S: HealthSink>(self, sink: S) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(self.refresh_rate);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let healthy = self.check_once().await;
                        if healthy.is_empty() {
                            tracing::error!("no healthy backends; requests will receive llmUrl=None until a backend recovers");
                        }
                        sink.update_servers(healthy);
                    }
                }
            }
        });
        (shutdown_tx, handle)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::collections::HashMap;

    struct ScriptedProbe(HashMap<String, bool>);

    #[async_trait::async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn is_healthy(&self, backend: &Backend) -> bool {
            *self.0.get(&backend.url).unwrap_or(&false)
        }
    }

    fn backend(url: &str, org: &str) -> Backend {
        Backend { url: url.to_string(), token: None, organization: org.to_string(), max_parallel_requests: 20 }
    }

    #[tokio::test]
    async fn check_once_preserves_registry_order_over_healthy_subset() {
        let probe = Arc::new(ScriptedProbe(HashMap::from([
            ("http://a".to_string(), true),
            ("http://b".to_string(), false),
            ("http://c".to_string(), true),
        ])));
        let backends = vec![backend("http://a", "o"), backend("http://b", "o"), backend("http://c", "o")];
        let pinger = ServerPinger::new(probe, backends, Duration::from_secs(1));

        let healthy = pinger.check_once().await;
        let urls: Vec<_> = healthy.iter().map(|b| b.url.clone()).collect();
        assert_eq!(urls, vec!["http://a".to_string(), "http://c".to_string()]);
    }

    #[test]
    fn healthy_backends_sink_reports_current_snapshot() {
        let sink = HealthyBackends::new();
        assert!(sink.get().is_empty());
        sink.update_servers(vec![backend("http://a", "o")]);
        assert_eq!(sink.get().len(), 1);
    }

    #[tokio::test]
    async fn empty_healthy_set_is_published_not_hidden() {
        let called = Arc::new(AtomicBool::new(false));
        struct FlagSink(Arc<AtomicBool>);
        impl HealthSink for FlagSink {
            fn update_servers(&self, healthy: Vec<Backend>) {
                assert!(healthy.is_empty());
                self.0.store(true, Ordering::SeqCst);
            }
        }
        let probe = Arc::new(ScriptedProbe(HashMap::new()));
        let pinger = ServerPinger::new(probe, vec![backend("http://a", "o")], Duration::from_millis(10));
        let healthy = pinger.check_once().await;
        FlagSink(Arc::clone(&called)).update_servers(healthy);
        assert!(called.load(Ordering::SeqCst));
    }
}

//! SelectionStrategy — round-robin and least-busy backend selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::seq::IteratorRandom;

use crate::backend::Backend;
use crate::error::GatewayError;
use crate::histogram::Bound;
use crate::metrics::{MetricsFetcher, MetricsTracker};
use crate::pinger::HealthSink;

/// The p95 percentile this crate uses for the least-busy score.
pub const SCORE_PERCENTILE: f64 = 0.95;

/// Sentinel score meaning "no measurements yet" — strictly preferred over
/// any numeric score.
pub const NO_DATA_SCORE: f64 = -1.0;

/// A chosen backend plus, for strategies that track load, the score used to
/// pick it (the least-busy p95 bucket upper bound; `None` for round-robin).
#[derive(Debug, Clone)]
pub struct Choice {
    /// The selected backend.
    pub backend: Backend,
    /// The score that won the selection, if the strategy tracks one.
    pub score: Option<f64>,
}

/// Common contract implemented by both `RoundRobin` and `LeastBusy`.
pub trait SelectionStrategy: HealthSink {
    /// The currently active (healthy) backend set.
    fn active_servers(&self) -> Arc<Vec<Backend>>;

    /// Pick a backend from an arbitrary candidate slice, e.g. a single
    /// organization's private pool.
    fn choose_from(&self, candidates: &[Backend]) -> Result<Choice, GatewayError>;

    /// Pick one backend from the full active set, or `ServerNotFound` if it
    /// is empty.
    fn choose_server(&self) -> Result<Choice, GatewayError> {
        self.choose_from(&self.active_servers())
    }
}

/// Strict round-robin rotation over the active backend set.
pub struct RoundRobin {
    servers: ArcSwap<Vec<Backend>>,
    index: AtomicUsize,
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobin {
    /// An empty round-robin strategy; call `update_servers` before use.
    pub fn new() -> Self {
        Self { servers: ArcSwap::from_pointee(Vec::new()), index: AtomicUsize::new(0) }
    }
}

impl HealthSink for RoundRobin {
    fn update_servers(&self, healthy: Vec<Backend>) {
        let current = self.servers.load();
        if **current == healthy {
            return;
        }
        self.servers.store(Arc::new(healthy));
        self.index.store(0, Ordering::SeqCst);
    }
}

impl SelectionStrategy for RoundRobin {
    fn active_servers(&self) -> Arc<Vec<Backend>> {
        self.servers.load_full()
    }

    fn choose_from(&self, candidates: &[Backend]) -> Result<Choice, GatewayError> {
        if candidates.is_empty() {
            return Err(GatewayError::ServerNotFound);
        }
        let idx = self.index.fetch_add(1, Ordering::SeqCst) % candidates.len();
        Ok(Choice { backend: candidates[idx].clone(), score: None })
    }
}

/// Picks the backend with the lowest p95 time-to-first-token bucket,
/// preferring unmeasured backends (score [`NO_DATA_SCORE`]) to bootstrap
/// monitoring coverage. Ties are broken uniformly at random.
pub struct LeastBusy<F: MetricsFetcher> {
    servers: ArcSwap<Vec<Backend>>,
    tracker: Arc<MetricsTracker<F>>,
}

impl<F: MetricsFetcher> LeastBusy<F> {
    /// Build a least-busy strategy. `tracker` should already be constructed
    /// over the initial backend set; call `.monitor()` on it (or rely on
    /// `update_servers` doing so) to start refreshing.
    pub fn new(tracker: MetricsTracker<F>) -> Self {
        Self { servers: ArcSwap::from_pointee(Vec::new()), tracker: Arc::new(tracker) }
    }

    fn score_of(&self, backend: &Backend) -> f64 {
        let diff = self.tracker.diff_histogram(&backend.url);
        match diff.percentile(SCORE_PERCENTILE) {
            None => NO_DATA_SCORE,
            Some((_, Bound::Infinite)) => f64::INFINITY,
            Some((_, Bound::Finite(v))) => v,
        }
    }

    /// Pick the minimum-score backend from an arbitrary candidate slice
    /// (used directly by the private-queue handler, which restricts the
    /// candidate pool to one organization — same heuristic as
    /// `choose_server`).
    pub fn choose_from(&self, candidates: &[Backend]) -> Result<Choice, GatewayError> {
        if candidates.is_empty() {
            return Err(GatewayError::ServerNotFound);
        }

        let scored: Vec<(Backend, f64)> =
            candidates.iter().map(|b| (b.clone(), self.score_of(b))).collect();

        if let Some((backend, _)) = scored.iter().find(|(_, s)| *s == NO_DATA_SCORE) {
            return Ok(Choice { backend: backend.clone(), score: Some(NO_DATA_SCORE) });
        }

        let min_score = scored
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::INFINITY, f64::min);

        let winners = scored.iter().filter(|(_, s)| *s == min_score);
        let mut rng = rand::thread_rng();
        // `scored` is non-empty (checked above) and `min_score` is its own
        // fold result, so at least one entry always matches; fall back to
        // the first scored entry rather than panicking if that ever changes.
        let (backend, score) = winners.choose(&mut rng).unwrap_or(&scored[0]);

        Ok(Choice { backend: backend.clone(), score: Some(*score) })
    }
}

impl<F: MetricsFetcher> HealthSink for LeastBusy<F> {
    fn update_servers(&self, healthy: Vec<Backend>) {
        let current = self.servers.load();
        if **current == healthy {
            return;
        }
        let urls: Vec<String> = healthy.iter().map(|b| b.url.clone()).collect();
        self.servers.store(Arc::new(healthy));

        // `update_urls` is async (it awaits the old tasks shutting down
        // before respawning); this trait method is not, so the tracker
        // refresh runs as a detached task rather than blocking the caller.
        let tracker = Arc::clone(&self.tracker);
        tokio::spawn(async move {
            tracker.update_urls(&urls).await;
        });
    }
}

impl<F: MetricsFetcher> LeastBusy<F> {
    /// The currently active (healthy) backend set.
    pub fn active_servers(&self) -> Arc<Vec<Backend>> {
        self.servers.load_full()
    }
}

impl<F: MetricsFetcher> SelectionStrategy for LeastBusy<F> {
    fn active_servers(&self) -> Arc<Vec<Backend>> {
        self.active_servers()
    }

    fn choose_from(&self, candidates: &[Backend]) -> Result<Choice, GatewayError> {
        self.choose_from(candidates)
    }
}

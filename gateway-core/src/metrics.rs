//! MetricsTracker — per-backend windowed diff histograms, refreshed on
//! a timer by one long-running task per backend.
//!
//! Each task is paired with a `oneshot` shutdown signal and stopped/awaited
//! from `StopMonitor`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::oneshot;
use tokio::time::interval;

use crate::histogram::Histogram;

/// Fetches the raw `/metrics` exposition text for a backend URL. Implemented
/// by `reqwest` in the `consumer` binary; abstracted here so the windowed
/// refresh logic can be unit tested without a network dependency.
#[async_trait::async_trait]
pub trait MetricsFetcher: Send + Sync + 'static {
    /// Fetch `/metrics` text for `backend_url`, or `None` on any transport
    /// error (the tracker treats fetch failures as "skip this tick").
    async fn fetch(&self, backend_url: &str) -> Option<String>;
}

/// Ring-buffer state for one backend: `R` historical snapshots plus the
/// currently exposed diff histogram.
struct BackendWindow {
    slots: Vec<Histogram>,
    next_slot: usize,
    diff: Histogram,
}

impl BackendWindow {
    fn new(window_size: usize) -> Self {
        Self {
            slots: vec![Histogram::empty(); window_size.max(1)],
            next_slot: 0,
            diff: Histogram::empty(),
        }
    }

    /// Write `current` into the ring buffer, compute the new diff against
    /// the value the slot held before being overwritten, and advance.
    fn refresh(&mut self, current: Histogram) {
        let slot = self.next_slot;
        let previous = std::mem::replace(&mut self.slots[slot], current.clone());
        self.diff = Histogram::diff(&current, &previous);
        self.next_slot = (slot + 1) % self.slots.len();
    }
}

/// Per-backend sliding-window latency tracker.
///
/// One `tokio::spawn`ed task per backend fetches `/metrics`, parses the
/// time-to-first-token bucket series, and updates that backend's diff
/// histogram every `refresh_rate`. A fetch failure is debug-logged and
/// skipped — the tracker never kills its task over a transient error.
pub struct MetricsTracker<F: MetricsFetcher> {
    fetcher: Arc<F>,
    refresh_rate: Duration,
    window_size: usize,
    line_pattern: Regex,
    windows: Arc<DashMap<String, Arc<RwLock<BackendWindow>>>>,
    tasks: Arc<RwLock<Vec<(oneshot::Sender<()>, tokio::task::JoinHandle<()>)>>>,
}

impl<F: MetricsFetcher> MetricsTracker<F> {
    /// Build a tracker for the given backend URLs. Does not start monitoring
    /// — call [`MetricsTracker::monitor`] to spawn the per-backend tasks.
    #[allow(clippy::expect_used)] // pattern is a fixed literal, compiles or the crate is broken
    pub fn new(fetcher: Arc<F>, urls: &[String], refresh_rate: Duration, window_size: usize) -> Self {
        let line_pattern = Regex::new(r#"^vllm:time_to_first_token_seconds_bucket\{"#)
            .expect("static regex is valid");
        let windows = Arc::new(DashMap::new());
        for url in urls {
            windows.insert(url.clone(), Arc::new(RwLock::new(BackendWindow::new(window_size))));
        }
        Self {
            fetcher,
            refresh_rate,
            window_size,
            line_pattern,
            windows,
            tasks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Idempotent start: spawns one refresh task per known backend. Calling
    /// this while already monitoring is a no-op (tasks are only started
    /// once per `new`/`update_urls` cycle).
    pub fn monitor(&self) {
        if !self.tasks.read().is_empty() {
            return;
        }
        let mut tasks = self.tasks.write();
        for entry in self.windows.iter() {
            let url = entry.key().clone();
            let window = Arc::clone(entry.value());
            let fetcher = Arc::clone(&self.fetcher);
            let refresh_rate = self.refresh_rate;
            let line_pattern = self.line_pattern.clone();

            let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
            let handle = tokio::spawn(async move {
                let mut ticker = interval(refresh_rate);
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = ticker.tick() => {
                            match fetcher.fetch(&url).await {
                                Some(text) => {
                                    let parsed = Histogram::parse(&text, &line_pattern);
                                    window.write().refresh(parsed);
                                }
                                None => {
                                    tracing::debug!(backend = %url, "metrics fetch failed, skipping tick");
                                }
                            }
                        }
                    }
                }
            });
            tasks.push((shutdown_tx, handle));
        }
    }

    /// Cancel all per-backend tasks and await their completion.
    pub async fn stop_monitor(&self) {
        let mut tasks = self.tasks.write();
        let drained: Vec<_> = tasks.drain(..).collect();
        drop(tasks);
        for (shutdown_tx, handle) in drained {
            let _ = shutdown_tx.send(());
            let _ = handle.await;
        }
    }

    /// Stop monitoring, replace the tracked URL set, and restart.
    pub async fn update_urls(&self, urls: &[String]) {
        self.stop_monitor().await;
        self.windows.clear();
        for url in urls {
            self.windows
                .insert(url.clone(), Arc::new(RwLock::new(BackendWindow::new(self.window_size))));
        }
        self.monitor();
    }

    /// The current diff histogram for `backend_url`, or an empty histogram
    /// if the backend has never served a request (or is unknown).
    pub fn diff_histogram(&self, backend_url: &str) -> Histogram {
        self.windows
            .get(backend_url)
            .map(|w| w.read().diff.clone())
            .unwrap_or_else(Histogram::empty)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedFetcher {
        responses: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MetricsFetcher for ScriptedFetcher {
        async fn fetch(&self, _backend_url: &str) -> Option<String> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.get(idx.min(self.responses.len() - 1)).cloned()
        }
    }

    fn sample(total: i64) -> String {
        format!(
            "vllm:time_to_first_token_seconds_bucket{{le=\"0.5\"}} {}\nvllm:time_to_first_token_seconds_bucket{{le=\"+Inf\"}} {}\n",
            total, total
        )
    }

    #[test]
    fn never_served_backend_has_empty_diff() {
        let fetcher = Arc::new(ScriptedFetcher { responses: vec![], calls: AtomicUsize::new(0) });
        let tracker = MetricsTracker::new(fetcher, &["http://a".to_string()], Duration::from_secs(1), 3);
        assert!(tracker.diff_histogram("http://a").is_empty());
        assert!(tracker.diff_histogram("http://unknown").is_empty());
    }

    #[tokio::test]
    async fn refresh_accumulates_window_diff() {
        let mut window = BackendWindow::new(2);
        let line_pattern = Regex::new(r#"^vllm:time_to_first_token_seconds_bucket\{"#).unwrap();

        window.refresh(Histogram::parse(&sample(5), &line_pattern));
        window.refresh(Histogram::parse(&sample(9), &line_pattern));
        // slot 0 held empty before this write -> diff is the full 9.
        assert_eq!(window.diff.total(), Some(9));

        window.refresh(Histogram::parse(&sample(12), &line_pattern));
        // slot 1 held the "5" snapshot before this write -> diff is 12-5=7.
        assert_eq!(window.diff.total(), Some(7));
    }
}

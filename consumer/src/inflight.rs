//! Per-backend in-flight request counters, floored at zero: a decrement
//! can never push a backend's count below zero.

use dashmap::DashMap;

/// Tracks how many requests are currently dispatched to each backend URL.
#[derive(Default)]
pub struct InFlightCounters {
    counts: DashMap<String, u32>,
}

impl InFlightCounters {
    /// An empty counter set.
    pub fn new() -> Self {
        Self { counts: DashMap::new() }
    }

    /// Increment the counter for `backend_url`, returning the new value.
    pub fn increment(&self, backend_url: &str) -> u32 {
        let mut entry = self.counts.entry(backend_url.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Decrement the counter for `backend_url`, floored at 0.
    pub fn decrement(&self, backend_url: &str) {
        if let Some(mut entry) = self.counts.get_mut(backend_url) {
            *entry = entry.saturating_sub(1);
        }
    }

    /// The current in-flight count for `backend_url` (0 if unknown).
    pub fn get(&self, backend_url: &str) -> u32 {
        self.counts.get(backend_url).map(|e| *e).unwrap_or(0)
    }
}

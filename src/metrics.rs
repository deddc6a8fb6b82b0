//! Per-endpoint counters for the retrieval contract.
//!
//! Counters only; anything richer belongs to an external observability sink.

use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointCounters {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub fallback_retries: u64,
}

/// Thread-safe counter store shared by contract clients.
#[derive(Debug, Default)]
pub struct MetricsStore {
    counters: Mutex<BTreeMap<String, EndpointCounters>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, endpoint: &str) {
        self.update(endpoint, |c| c.requests += 1);
    }

    pub fn record_success(&self, endpoint: &str) {
        self.update(endpoint, |c| c.successes += 1);
    }

    pub fn record_failure(&self, endpoint: &str) {
        self.update(endpoint, |c| c.failures += 1);
    }

    pub fn record_fallback_retry(&self, endpoint: &str) {
        self.update(endpoint, |c| c.fallback_retries += 1);
    }

    /// Snapshot of all counters.
    pub fn snapshot(&self) -> BTreeMap<String, EndpointCounters> {
        self.counters
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn update(&self, endpoint: &str, apply: impl FnOnce(&mut EndpointCounters)) {
        if let Ok(mut guard) = self.counters.lock() {
            apply(guard.entry(endpoint.to_string()).or_default());
        }
    }
}

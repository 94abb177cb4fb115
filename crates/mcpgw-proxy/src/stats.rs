//! Per-proxy request counters.
//!
//! The total is bumped exactly once per request before the outcome is
//! known; the outcome bucket and the response-time average follow on
//! completion.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
struct ResponseTimes {
    avg_ms: f64,
    samples: u64,
}

/// Live counters for one reverse proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    times: Mutex<ResponseTimes>,
    per_backend: Mutex<HashMap<String, u64>>,
}

/// Serializable snapshot of [`ProxyStats`].
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatsSnapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_time_ms: f64,
    pub requests_by_server: HashMap<String, u64>,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one incoming request against its backend.
    pub fn record_request(&self, backend: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut per_backend = self.per_backend.lock().unwrap();
        *per_backend.entry(backend.to_string()).or_insert(0) += 1;
    }

    /// Count a completed request and fold its latency into the average.
    pub fn record_success(&self, elapsed: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut times = self.times.lock().unwrap();
        times.samples += 1;
        let sample = elapsed.as_secs_f64() * 1_000.0;
        times.avg_ms += (sample - times.avg_ms) / times.samples as f64;
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            avg_response_time_ms: self.times.lock().unwrap().avg_ms,
            requests_by_server: self.per_backend.lock().unwrap().clone(),
        }
    }
}

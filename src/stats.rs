//! Statistics tracking for DNS proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic statistics for tracking proxy performance.
pub struct Stats {
    started: Instant,
    pub requests: AtomicU64,
    pub forwarded: AtomicU64,
    pub cached: AtomicU64,
    pub local: AtomicU64,
    pub failed: AtomicU64,
    /// Replies that carry no answer by design: empty questions, NOTIMP.
    pub other: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            local: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            other: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_forwarded(&self, elapsed: Duration) {
        self.record(&self.forwarded, elapsed);
    }

    pub fn record_cached(&self, elapsed: Duration) {
        self.record(&self.cached, elapsed);
    }

    pub fn record_local(&self, elapsed: Duration) {
        self.record(&self.local, elapsed);
    }

    pub fn record_failed(&self, elapsed: Duration) {
        self.record(&self.failed, elapsed);
    }

    pub fn record_other(&self, elapsed: Duration) {
        self.record(&self.other, elapsed);
    }

    fn record(&self, counter: &AtomicU64, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let forwarded = self.forwarded.swap(0, Ordering::Relaxed);
        let cached = self.cached.swap(0, Ordering::Relaxed);
        let local = self.local.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let other = self.other.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            requests,
            forwarded,
            cached,
            local,
            failed,
            other,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub requests: u64,
    pub forwarded: u64,
    pub cached: u64,
    pub local: u64,
    pub failed: u64,
    pub other: u64,
    pub avg_response_ms: f64,
}

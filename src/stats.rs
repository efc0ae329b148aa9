//! Statistics tracking for the filtering engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic statistics for tracking engine behaviour.
pub struct Stats {
    pub requests: AtomicU64,
    pub forwarded: AtomicU64,
    pub blocked: AtomicU64,
    pub hot_hits: AtomicU64,
    pub bulk_hits: AtomicU64,
    pub store_lookups: AtomicU64,
    pub store_failures: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
    started: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            hot_hits: AtomicU64::new(0),
            bulk_hits: AtomicU64::new(0),
            store_lookups: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_forwarded(&self, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_blocked(&self, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.blocked.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_hot_hit(&self) {
        self.hot_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bulk_hit(&self) {
        self.bulk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_lookup(&self) {
        self.store_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let forwarded = self.forwarded.swap(0, Ordering::Relaxed);
        let blocked = self.blocked.swap(0, Ordering::Relaxed);
        let hot_hits = self.hot_hits.swap(0, Ordering::Relaxed);
        let bulk_hits = self.bulk_hits.swap(0, Ordering::Relaxed);
        let store_lookups = self.store_lookups.swap(0, Ordering::Relaxed);
        let store_failures = self.store_failures.swap(0, Ordering::Relaxed);
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
            blocked,
            hot_hits,
            bulk_hits,
            store_lookups,
            store_failures,
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
    pub blocked: u64,
    pub hot_hits: u64,
    pub bulk_hits: u64,
    pub store_lookups: u64,
    pub store_failures: u64,
    pub avg_response_ms: f64,
}

//! # Command Metrics
//!
//! Provide lightweight counters and a latency histogram for commands issued
//! through a pool or failover client when debug timing is enabled.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Use atomic counters to aggregate events cheaply.
//! 2. **Fixed Buckets**: Keep histogram buckets in a contiguous array for cache locality.
//! 3. **Plain Snapshots**: Expose point-in-time values as plain structs.
//!
//! ## Notes
//! - Bucket boundaries are expressed in microseconds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Default latency bucket boundaries in microseconds.
///
/// Network round trips dominate, so the range runs from 50us to 1s.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] = [
    50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 100_000, 250_000, 1_000_000,
];

/// Snapshot of all command metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total number of commands observed.
    pub requests_total: u64,
    /// Total number of commands that failed (transport or server error).
    pub errors_total: u64,
    /// Current in-flight commands.
    pub inflight: u64,
    /// Commands observed per upper-cased command name.
    pub per_command: HashMap<String, u64>,
    /// Latency histogram snapshot.
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    /// Total number of samples.
    pub samples: u64,
    /// Sum of latencies in microseconds.
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Mean latency, or zero when nothing was recorded.
    pub fn mean(&self) -> Duration {
        if self.samples == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sum_us / self.samples)
    }
}

/// Thread-safe metrics aggregator for commands.
///
/// `Ordering::Relaxed` is sufficient because we do not require cross-field
/// ordering, only eventual consistency.
#[derive(Debug)]
pub struct CommandMetrics {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    inflight: AtomicU64,
    per_command: Mutex<HashMap<String, u64>>,
    latency: LatencyHistogram,
}

impl Default for CommandMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandMetrics {
    /// Creates a new metrics aggregator with the default latency buckets.
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// Creates a new metrics aggregator with custom latency bucket boundaries.
    ///
    /// The boundaries must be sorted ascending and represent microseconds.
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        CommandMetrics {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
            per_command: Mutex::new(HashMap::new()),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    /// Records the start of a command.
    pub fn record_start(&self, command: &str) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
        let mut per_command = self.per_command.lock();
        *per_command.entry(command.to_ascii_uppercase()).or_insert(0) += 1;
    }

    /// Records the end of a command.
    ///
    /// **Input**: `latency` measured for the command, `failed` when it
    /// returned an error of any kind.
    /// **Output**: none (side-effects only).
    pub fn record_end(&self, latency: Duration, failed: bool) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency);
    }

    /// Returns a snapshot of all counters and histogram buckets.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            per_command: self.per_command.lock().clone(),
            latency: self.latency.snapshot(),
        }
    }
}

/// Fixed-bucket latency histogram.
///
/// Uses a linear scan to pick buckets; this is O(buckets) but the list is small
/// and stays hot in cache.
#[derive(Debug)]
struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with `bounds_us.len() + 1` buckets (last is overflow).
    fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Records a latency measurement into the first bucket where
    /// `micros <= bound`, otherwise into the overflow bucket.
    fn record(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_requests_and_errors() {
        let metrics = CommandMetrics::new();
        metrics.record_start("get");
        metrics.record_start("GET");
        metrics.record_start("set");
        metrics.record_end(Duration::from_micros(10), false);
        metrics.record_end(Duration::from_micros(10), true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.errors_total, 1);
        assert_eq!(snapshot.inflight, 1);
        assert_eq!(snapshot.per_command.get("GET"), Some(&2));
        assert_eq!(snapshot.per_command.get("SET"), Some(&1));
    }

    #[test]
    fn histogram_uses_overflow_bucket() {
        let metrics = CommandMetrics::with_latency_buckets(vec![10, 100]);
        for micros in [5, 10, 50, 1_000] {
            metrics.record_start("PING");
            metrics.record_end(Duration::from_micros(micros), false);
        }

        let latency = metrics.snapshot().latency;
        assert_eq!(latency.buckets, vec![2, 1, 1]);
        assert_eq!(latency.samples, 4);
        assert_eq!(latency.sum_us, 1_065);
        assert_eq!(latency.mean(), Duration::from_micros(266));
    }
}

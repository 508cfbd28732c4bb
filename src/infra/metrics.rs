//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention with the
//! tracker lock. Reporting swaps the periodic counters to get a consistent
//! snapshot while the polling loop keeps recording. Scrapes read the
//! cumulative copies through `totals()` and never touch the periodic window.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Poll round-trip bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2000, ≤5000, >5000
const BUCKET_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2000, 5000];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [5, 10, 25, 50, 100, 250, 500, 1000, 2000, 5000, 10000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Poll cycles completed, live or simulated (monotonic)
    cycles_total: AtomicU64,
    /// Cycles since last report (reset on report)
    cycles_since_report: AtomicU64,
    /// Cycles that produced no tag (monotonic)
    empty_cycles_total: AtomicU64,
    /// Tag identifiers read across all cycles (monotonic)
    tags_read_total: AtomicU64,
    /// Polls that hit the read timeout before a terminator (monotonic)
    poll_timeouts_total: AtomicU64,
    /// Connect attempts against the reader (monotonic)
    connect_attempts_total: AtomicU64,
    /// Failed connect attempts (monotonic)
    connect_failures_total: AtomicU64,
    /// Sessions lost mid-poll (monotonic)
    session_drops_total: AtomicU64,
    /// Unexpected loop errors, including caught panics (monotonic)
    loop_errors_total: AtomicU64,
    /// Snapshots computed for consumers (monotonic)
    snapshots_total: AtomicU64,
    /// Currently connected stream subscribers
    subscribers: AtomicU64,
    /// Poll round-trip histogram, ms (reset on report)
    poll_latency_buckets: [AtomicU64; NUM_BUCKETS],
    poll_latency_sum_ms: AtomicU64,
    poll_latency_max_ms: AtomicU64,
    /// Poll round-trip histogram, ms (monotonic, never reset)
    poll_latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    poll_latency_sum_total_ms: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            cycles_since_report: AtomicU64::new(0),
            empty_cycles_total: AtomicU64::new(0),
            tags_read_total: AtomicU64::new(0),
            poll_timeouts_total: AtomicU64::new(0),
            connect_attempts_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            session_drops_total: AtomicU64::new(0),
            loop_errors_total: AtomicU64::new(0),
            snapshots_total: AtomicU64::new(0),
            subscribers: AtomicU64::new(0),
            poll_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            poll_latency_sum_ms: AtomicU64::new(0),
            poll_latency_max_ms: AtomicU64::new(0),
            poll_latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            poll_latency_sum_total_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one completed cycle and the number of tags it carried
    #[inline]
    pub fn record_cycle(&self, tags: usize) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        self.cycles_since_report.fetch_add(1, Ordering::Relaxed);
        self.tags_read_total.fetch_add(tags as u64, Ordering::Relaxed);
        if tags == 0 {
            self.empty_cycles_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record poll round-trip latency
    #[inline]
    pub fn record_poll_latency(&self, latency_ms: u64) {
        let idx = bucket_index(latency_ms);
        self.poll_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.poll_latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.poll_latency_sum_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.poll_latency_buckets_total[idx].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.poll_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_poll_timeout(&self) {
        self.poll_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_attempt(&self) {
        self.connect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_failure(&self) {
        self.connect_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_drop(&self) {
        self.session_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_loop_error(&self) {
        self.loop_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot(&self) {
        self.snapshots_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn subscriber_connected(&self) {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn subscriber_disconnected(&self) {
        // Saturating: never wrap below zero
        let _ = self.subscribers.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        });
    }

    #[inline]
    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn poll_timeouts_total(&self) -> u64 {
        self.poll_timeouts_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn connect_failures_total(&self) -> u64 {
        self.connect_failures_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn loop_errors_total(&self) -> u64 {
        self.loop_errors_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn subscribers(&self) -> u64 {
        self.subscribers.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let cycles_count = self.cycles_since_report.swap(0, Ordering::Relaxed);
        let poll_lat_buckets = swap_buckets(&self.poll_latency_buckets);
        let poll_lat_sum = self.poll_latency_sum_ms.swap(0, Ordering::Relaxed);
        let poll_lat_max_ms = self.poll_latency_max_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let cycles_per_sec = if elapsed.as_secs_f64() > 0.0 {
            cycles_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let poll_count: u64 = poll_lat_buckets.iter().sum();
        let poll_lat_avg_ms = if poll_count > 0 { poll_lat_sum / poll_count } else { 0 };

        MetricsSummary {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_per_sec,
            empty_cycles_total: self.empty_cycles_total.load(Ordering::Relaxed),
            tags_read_total: self.tags_read_total.load(Ordering::Relaxed),
            poll_timeouts_total: self.poll_timeouts_total.load(Ordering::Relaxed),
            connect_attempts_total: self.connect_attempts_total.load(Ordering::Relaxed),
            connect_failures_total: self.connect_failures_total.load(Ordering::Relaxed),
            session_drops_total: self.session_drops_total.load(Ordering::Relaxed),
            loop_errors_total: self.loop_errors_total.load(Ordering::Relaxed),
            snapshots_total: self.snapshots_total.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            poll_lat_buckets,
            poll_lat_avg_ms,
            poll_lat_max_ms,
            poll_lat_p50_ms: percentile_from_buckets(&poll_lat_buckets, 0.50),
            poll_lat_p99_ms: percentile_from_buckets(&poll_lat_buckets, 0.99),
        }
    }

    /// Read every monotonic counter without resetting anything
    pub fn totals(&self) -> MetricsTotals {
        let mut poll_lat_buckets = [0u64; NUM_BUCKETS];
        for (slot, bucket) in poll_lat_buckets.iter_mut().zip(&self.poll_latency_buckets_total) {
            *slot = bucket.load(Ordering::Relaxed);
        }

        MetricsTotals {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            empty_cycles_total: self.empty_cycles_total.load(Ordering::Relaxed),
            tags_read_total: self.tags_read_total.load(Ordering::Relaxed),
            poll_timeouts_total: self.poll_timeouts_total.load(Ordering::Relaxed),
            connect_attempts_total: self.connect_attempts_total.load(Ordering::Relaxed),
            connect_failures_total: self.connect_failures_total.load(Ordering::Relaxed),
            session_drops_total: self.session_drops_total.load(Ordering::Relaxed),
            loop_errors_total: self.loop_errors_total.load(Ordering::Relaxed),
            snapshots_total: self.snapshots_total.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            poll_lat_buckets,
            poll_lat_sum_ms: self.poll_latency_sum_total_ms.load(Ordering::Relaxed),
            poll_lat_p50_ms: percentile_from_buckets(&poll_lat_buckets, 0.50),
            poll_lat_p99_ms: percentile_from_buckets(&poll_lat_buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub cycles_total: u64,
    pub cycles_per_sec: f64,
    pub empty_cycles_total: u64,
    pub tags_read_total: u64,
    pub poll_timeouts_total: u64,
    pub connect_attempts_total: u64,
    pub connect_failures_total: u64,
    pub session_drops_total: u64,
    pub loop_errors_total: u64,
    pub snapshots_total: u64,
    pub subscribers: u64,
    /// Poll round-trip histogram buckets (ms)
    /// Bounds: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2000, ≤5000, >5000
    pub poll_lat_buckets: [u64; NUM_BUCKETS],
    pub poll_lat_avg_ms: u64,
    pub poll_lat_max_ms: u64,
    pub poll_lat_p50_ms: u64,
    pub poll_lat_p99_ms: u64,
}

/// Process-lifetime counters for scrapers
#[derive(Debug)]
pub struct MetricsTotals {
    pub cycles_total: u64,
    pub empty_cycles_total: u64,
    pub tags_read_total: u64,
    pub poll_timeouts_total: u64,
    pub connect_attempts_total: u64,
    pub connect_failures_total: u64,
    pub session_drops_total: u64,
    pub loop_errors_total: u64,
    pub snapshots_total: u64,
    pub subscribers: u64,
    /// Per-bucket counts since start, same bounds as `MetricsSummary`
    pub poll_lat_buckets: [u64; NUM_BUCKETS],
    pub poll_lat_sum_ms: u64,
    pub poll_lat_p50_ms: u64,
    pub poll_lat_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            cycles_total = %self.cycles_total,
            cycles_per_sec = format!("{:.2}", self.cycles_per_sec),
            tags_read = %self.tags_read_total,
            empty_cycles = %self.empty_cycles_total,
            poll_timeouts = %self.poll_timeouts_total,
            connect_failures = %self.connect_failures_total,
            session_drops = %self.session_drops_total,
            loop_errors = %self.loop_errors_total,
            subscribers = %self.subscribers,
            poll_p50_ms = %self.poll_lat_p50_ms,
            poll_p99_ms = %self.poll_lat_p99_ms,
            "metrics"
        );
    }
}

//! Alert service metrics: cycles, cache, dispatch
//!
//! Counters are plain atomics bumped from the pipeline, cache and dispatcher.
//! `report()` swaps the periodic counters (durations, chunk latencies) to zero
//! and reads the cumulative ones, so every report covers the interval since the
//! previous one.
//!
//! All atomics use Relaxed ordering. They are statistics only and must not
//! drive control flow.

use crate::domain::types::{AlertKind, DispatchResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
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

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Alert cycles started (monotonic)
    cycles_total: AtomicU64,
    /// Cycles aborted with an error, e.g. no weather data (monotonic)
    cycles_failed_total: AtomicU64,
    /// Triggers skipped because the site already had a run in flight (monotonic)
    cycles_skipped_total: AtomicU64,
    /// Cycles where no threshold was crossed (monotonic)
    cycles_no_alert_total: AtomicU64,
    /// Cycle duration histogram (reset on report)
    cycle_duration_buckets: [AtomicU64; NUM_BUCKETS],
    cycle_duration_sum_ms: AtomicU64,
    cycle_duration_max_ms: AtomicU64,
    cycles_since_report: AtomicU64,
    /// Alerts fired per kind (monotonic), indexed by `AlertKind` order
    alerts_fired: [AtomicU64; 3],
    /// Cache lookups served fresh (monotonic)
    cache_hits_total: AtomicU64,
    /// Cache lookups that went upstream (monotonic)
    cache_misses_total: AtomicU64,
    /// Samples served from an expired entry after a failed refresh (monotonic)
    cache_stale_total: AtomicU64,
    /// Entries removed by the sweep (monotonic)
    cache_evicted_total: AtomicU64,
    /// Current cache size (updated by sweeper)
    cache_entries: AtomicU64,
    /// Failed weather fetches (monotonic)
    upstream_errors_total: AtomicU64,
    /// Tokens handed to the dispatcher (monotonic)
    dispatch_attempted_total: AtomicU64,
    dispatch_succeeded_total: AtomicU64,
    dispatch_failed_total: AtomicU64,
    /// Tokens attempted since last report (reset on report)
    tokens_since_report: AtomicU64,
    /// Chunk calls made to the push provider (monotonic)
    chunks_sent_total: AtomicU64,
    /// Chunk calls that failed as a whole (monotonic)
    chunks_failed_total: AtomicU64,
    /// Chunk send latency histogram (reset on report)
    chunk_latency_buckets: [AtomicU64; NUM_BUCKETS],
    chunk_latency_sum_ms: AtomicU64,
    chunk_latency_max_ms: AtomicU64,
    chunks_since_report: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            cycles_failed_total: AtomicU64::new(0),
            cycles_skipped_total: AtomicU64::new(0),
            cycles_no_alert_total: AtomicU64::new(0),
            cycle_duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            cycle_duration_sum_ms: AtomicU64::new(0),
            cycle_duration_max_ms: AtomicU64::new(0),
            cycles_since_report: AtomicU64::new(0),
            alerts_fired: std::array::from_fn(|_| AtomicU64::new(0)),
            cache_hits_total: AtomicU64::new(0),
            cache_misses_total: AtomicU64::new(0),
            cache_stale_total: AtomicU64::new(0),
            cache_evicted_total: AtomicU64::new(0),
            cache_entries: AtomicU64::new(0),
            upstream_errors_total: AtomicU64::new(0),
            dispatch_attempted_total: AtomicU64::new(0),
            dispatch_succeeded_total: AtomicU64::new(0),
            dispatch_failed_total: AtomicU64::new(0),
            tokens_since_report: AtomicU64::new(0),
            chunks_sent_total: AtomicU64::new(0),
            chunks_failed_total: AtomicU64::new(0),
            chunk_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            chunk_latency_sum_ms: AtomicU64::new(0),
            chunk_latency_max_ms: AtomicU64::new(0),
            chunks_since_report: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    fn kind_index(kind: AlertKind) -> usize {
        match kind {
            AlertKind::Rain => 0,
            AlertKind::Heat => 1,
            AlertKind::Wind => 2,
        }
    }

    /// Record a finished cycle and its wall-clock duration
    #[inline]
    pub fn record_cycle(&self, duration_ms: u64, fired_alerts: usize) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        self.cycles_since_report.fetch_add(1, Ordering::Relaxed);
        if fired_alerts == 0 {
            self.cycles_no_alert_total.fetch_add(1, Ordering::Relaxed);
        }
        self.cycle_duration_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.cycle_duration_buckets[bucket_index(duration_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.cycle_duration_max_ms, duration_ms);
    }

    #[inline]
    pub fn record_cycle_failed(&self) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        self.cycles_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycle_skipped(&self) {
        self.cycles_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_fired(&self, kind: AlertKind) {
        self.alerts_fired[Self::kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_stale(&self) {
        self.cache_stale_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_upstream_error(&self) {
        self.upstream_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sweep: how many entries were removed and how many remain
    #[inline]
    pub fn record_cache_sweep(&self, evicted: usize, remaining: usize) {
        self.cache_evicted_total.fetch_add(evicted as u64, Ordering::Relaxed);
        self.cache_entries.store(remaining as u64, Ordering::Relaxed);
    }

    /// Record one chunk call to the push provider
    #[inline]
    pub fn record_chunk(&self, latency_ms: u64, transport_failed: bool) {
        self.chunks_sent_total.fetch_add(1, Ordering::Relaxed);
        self.chunks_since_report.fetch_add(1, Ordering::Relaxed);
        if transport_failed {
            self.chunks_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.chunk_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.chunk_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.chunk_latency_max_ms, latency_ms);
    }

    /// Fold a finished dispatch into the token counters
    #[inline]
    pub fn record_dispatch(&self, result: &DispatchResult) {
        let attempted = result.attempted() as u64;
        self.dispatch_attempted_total.fetch_add(attempted, Ordering::Relaxed);
        self.tokens_since_report.fetch_add(attempted, Ordering::Relaxed);
        self.dispatch_succeeded_total.fetch_add(result.succeeded() as u64, Ordering::Relaxed);
        self.dispatch_failed_total.fetch_add(result.failed() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cycles_skipped_total(&self) -> u64 {
        self.cycles_skipped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cache_hits_total(&self) -> u64 {
        self.cache_hits_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cache_misses_total(&self) -> u64 {
        self.cache_misses_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cache_stale_total(&self) -> u64 {
        self.cache_stale_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dispatch_attempted_total(&self) -> u64 {
        self.dispatch_attempted_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn chunks_sent_total(&self) -> u64 {
        self.chunks_sent_total.load(Ordering::Relaxed)
    }

    /// Generate a summary and reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        // Periodic counters (swap to zero)
        let cycles = self.cycles_since_report.swap(0, Ordering::Relaxed);
        let cycle_sum = self.cycle_duration_sum_ms.swap(0, Ordering::Relaxed);
        let cycle_max = self.cycle_duration_max_ms.swap(0, Ordering::Relaxed);
        let cycle_buckets = swap_buckets(&self.cycle_duration_buckets);

        let chunks = self.chunks_since_report.swap(0, Ordering::Relaxed);
        let chunk_sum = self.chunk_latency_sum_ms.swap(0, Ordering::Relaxed);
        let chunk_max = self.chunk_latency_max_ms.swap(0, Ordering::Relaxed);
        let chunk_buckets = swap_buckets(&self.chunk_latency_buckets);

        let tokens = self.tokens_since_report.swap(0, Ordering::Relaxed);
        let tokens_per_sec = if elapsed_secs > 0.0 { tokens as f64 / elapsed_secs } else { 0.0 };

        MetricsSummary {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_failed_total: self.cycles_failed_total.load(Ordering::Relaxed),
            cycles_skipped_total: self.cycles_skipped_total.load(Ordering::Relaxed),
            cycles_no_alert_total: self.cycles_no_alert_total.load(Ordering::Relaxed),
            cycle_buckets,
            cycle_avg_ms: if cycles > 0 { cycle_sum / cycles } else { 0 },
            cycle_max_ms: cycle_max,
            cycle_p99_ms: percentile_from_buckets(&cycle_buckets, 0.99),
            rain_alerts_total: self.alerts_fired[0].load(Ordering::Relaxed),
            heat_alerts_total: self.alerts_fired[1].load(Ordering::Relaxed),
            wind_alerts_total: self.alerts_fired[2].load(Ordering::Relaxed),
            cache_hits_total: self.cache_hits_total.load(Ordering::Relaxed),
            cache_misses_total: self.cache_misses_total.load(Ordering::Relaxed),
            cache_stale_total: self.cache_stale_total.load(Ordering::Relaxed),
            cache_evicted_total: self.cache_evicted_total.load(Ordering::Relaxed),
            cache_entries: self.cache_entries.load(Ordering::Relaxed),
            upstream_errors_total: self.upstream_errors_total.load(Ordering::Relaxed),
            dispatch_attempted_total: self.dispatch_attempted_total.load(Ordering::Relaxed),
            dispatch_succeeded_total: self.dispatch_succeeded_total.load(Ordering::Relaxed),
            dispatch_failed_total: self.dispatch_failed_total.load(Ordering::Relaxed),
            tokens_per_sec,
            chunks_sent_total: self.chunks_sent_total.load(Ordering::Relaxed),
            chunks_failed_total: self.chunks_failed_total.load(Ordering::Relaxed),
            chunk_buckets,
            chunk_avg_ms: if chunks > 0 { chunk_sum / chunks } else { 0 },
            chunk_max_ms: chunk_max,
            chunk_p50_ms: percentile_from_buckets(&chunk_buckets, 0.50),
            chunk_p99_ms: percentile_from_buckets(&chunk_buckets, 0.99),
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
    pub cycles_failed_total: u64,
    pub cycles_skipped_total: u64,
    pub cycles_no_alert_total: u64,
    /// Cycle duration histogram buckets (ms)
    pub cycle_buckets: [u64; NUM_BUCKETS],
    pub cycle_avg_ms: u64,
    pub cycle_max_ms: u64,
    pub cycle_p99_ms: u64,
    pub rain_alerts_total: u64,
    pub heat_alerts_total: u64,
    pub wind_alerts_total: u64,
    pub cache_hits_total: u64,
    pub cache_misses_total: u64,
    pub cache_stale_total: u64,
    pub cache_evicted_total: u64,
    /// Cache size at the last sweep
    pub cache_entries: u64,
    pub upstream_errors_total: u64,
    pub dispatch_attempted_total: u64,
    pub dispatch_succeeded_total: u64,
    pub dispatch_failed_total: u64,
    pub tokens_per_sec: f64,
    pub chunks_sent_total: u64,
    pub chunks_failed_total: u64,
    /// Chunk send latency histogram buckets (ms)
    pub chunk_buckets: [u64; NUM_BUCKETS],
    pub chunk_avg_ms: u64,
    pub chunk_max_ms: u64,
    pub chunk_p50_ms: u64,
    pub chunk_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            cycles_total = %self.cycles_total,
            cycles_failed = %self.cycles_failed_total,
            cycles_skipped = %self.cycles_skipped_total,
            cycle_avg_ms = %self.cycle_avg_ms,
            cache_hits = %self.cache_hits_total,
            cache_misses = %self.cache_misses_total,
            cache_stale = %self.cache_stale_total,
            upstream_errors = %self.upstream_errors_total,
            tokens_attempted = %self.dispatch_attempted_total,
            tokens_succeeded = %self.dispatch_succeeded_total,
            tokens_failed = %self.dispatch_failed_total,
            tokens_per_sec = format!("{:.1}", self.tokens_per_sec),
            chunk_p99_ms = %self.chunk_p99_ms,
            "metrics"
        );
    }
}

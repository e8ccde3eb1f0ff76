//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so the dispatch loop never contends with the HTTP surface.
//! Reporting swaps the periodic counters; monotonic counters are never reset.
//!
//! All atomics use Relaxed ordering. They are counters only and must not be
//! used for coordination.

use crate::domain::mission::EndUseType;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Pipeline latency bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, ≤10000, >10000
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = [10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Stream state values for the Prometheus gauge
pub const STREAM_STATE_CONNECTING: u64 = 0;
pub const STREAM_STATE_CONNECTED: u64 = 1;
pub const STREAM_STATE_RECONNECTING: u64 = 2;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

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

#[inline]
fn load_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile).ceil() as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 20000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

fn end_use_index(end_use: EndUseType) -> usize {
    EndUseType::ALL.iter().position(|e| *e == end_use).unwrap_or(EndUseType::ALL.len() - 1)
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Stream messages received (monotonic)
    events_received: AtomicU64,
    /// Events classified, persisted or not (monotonic)
    events_classified: AtomicU64,
    /// Messages that did not decode into a mission (monotonic)
    decode_failures: AtomicU64,
    /// Missions dropped by the pipeline (monotonic)
    pipeline_failures: AtomicU64,
    /// Classifications the sink rejected (monotonic)
    sink_failures: AtomicU64,
    /// Reconnect cycles of the mission stream (monotonic)
    reconnects: AtomicU64,
    /// Current stream state (0=connecting, 1=connected, 2=reconnecting)
    stream_state: AtomicU64,
    /// Predictions per end use, indexed like `EndUseType::ALL`
    predictions: [AtomicU64; 7],
    /// Pipeline latency histogram (monotonic, exposed to Prometheus)
    latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    latency_sum_ms: AtomicU64,
    /// Periodic counters (reset on report)
    classified_since_report: AtomicU64,
    latency_max_ms: AtomicU64,
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_classified: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            pipeline_failures: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            stream_state: AtomicU64::new(STREAM_STATE_CONNECTING),
            predictions: Default::default(),
            latency_buckets: Default::default(),
            latency_sum_ms: AtomicU64::new(0),
            classified_since_report: AtomicU64::new(0),
            latency_max_ms: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pipeline_failure(&self) {
        self.pipeline_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a classified event and how long its pipeline run took
    pub fn record_classification(&self, end_use: EndUseType, latency_ms: u64) {
        self.events_classified.fetch_add(1, Ordering::Relaxed);
        self.classified_since_report.fetch_add(1, Ordering::Relaxed);
        self.predictions[end_use_index(end_use)].fetch_add(1, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_ms, latency_ms);
    }

    pub fn set_stream_state(&self, state: u64) {
        self.stream_state.store(state, Ordering::Relaxed);
    }

    pub fn stream_state(&self) -> u64 {
        self.stream_state.load(Ordering::Relaxed)
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn events_classified(&self) -> u64 {
        self.events_classified.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn pipeline_failures(&self) -> u64 {
        self.pipeline_failures.load(Ordering::Relaxed)
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Prediction counts per end use, in `EndUseType::ALL` order
    pub fn predictions(&self) -> Vec<(EndUseType, u64)> {
        EndUseType::ALL
            .iter()
            .zip(self.predictions.iter())
            .map(|(end_use, count)| (*end_use, count.load(Ordering::Relaxed)))
            .collect()
    }

    /// Latency histogram buckets and sum, without resetting anything
    pub fn latency_histogram(&self) -> ([u64; METRICS_NUM_BUCKETS], u64) {
        (load_buckets(&self.latency_buckets), self.latency_sum_ms.load(Ordering::Relaxed))
    }

    /// Snapshot for reporting; resets only the periodic counters
    pub fn report(&self) -> MetricsSummary {
        let classified_since_report = self.classified_since_report.swap(0, Ordering::Relaxed);
        let latency_max_ms = self.latency_max_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let classified_per_min = if elapsed.as_secs_f64() > 0.0 {
            classified_since_report as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let lat_buckets = load_buckets(&self.latency_buckets);
        let events_classified = self.events_classified();
        let latency_sum_ms = self.latency_sum_ms.load(Ordering::Relaxed);
        let avg_latency_ms =
            if events_classified > 0 { latency_sum_ms / events_classified } else { 0 };

        MetricsSummary {
            events_received: self.events_received(),
            events_classified,
            decode_failures: self.decode_failures(),
            pipeline_failures: self.pipeline_failures(),
            sink_failures: self.sink_failures(),
            reconnects: self.reconnects(),
            stream_state: self.stream_state(),
            classified_per_min,
            avg_latency_ms,
            latency_sum_ms,
            latency_max_ms,
            lat_p50_ms: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_ms: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_received: u64,
    pub events_classified: u64,
    pub decode_failures: u64,
    pub pipeline_failures: u64,
    pub sink_failures: u64,
    pub reconnects: u64,
    pub stream_state: u64,
    /// Classifications per minute since the previous report
    pub classified_per_min: f64,
    pub avg_latency_ms: u64,
    pub latency_sum_ms: u64,
    /// Max pipeline latency since the previous report
    pub latency_max_ms: u64,
    pub lat_p50_ms: u64,
    pub lat_p99_ms: u64,
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events_received = %self.events_received,
            events_classified = %self.events_classified,
            classified_per_min = format!("{:.1}", self.classified_per_min),
            decode_failures = %self.decode_failures,
            pipeline_failures = %self.pipeline_failures,
            sink_failures = %self.sink_failures,
            reconnects = %self.reconnects,
            stream_state = %self.stream_state,
            avg_latency_ms = %self.avg_latency_ms,
            max_latency_ms = %self.latency_max_ms,
            p50_ms = %self.lat_p50_ms,
            p99_ms = %self.lat_p99_ms,
            "metrics_summary"
        );
    }
}

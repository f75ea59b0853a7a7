//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics updated from the doorway tasks and the publish
//! worker. Per-doorway gauges live behind a read-mostly lock since they are
//! written once per crossing or snapshot.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Store write latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000
const BUCKET_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];
const NUM_BUCKETS: usize = 11;

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

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Latest observed state of one doorway
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DoorwayGauge {
    pub room_id: String,
    pub occupancy: u32,
    pub crowdiness_index: Option<f64>,
    pub debounce_secs: f64,
}

/// Lock-free metrics collector
pub struct Metrics {
    lines_total: AtomicU64,
    lines_since_report: AtomicU64,
    parse_errors_total: AtomicU64,
    /// Lines dropped because the doorway mode does not accept their kind
    lines_filtered_total: AtomicU64,
    enters_total: AtomicU64,
    exits_total: AtomicU64,
    snapshots_total: AtomicU64,
    publish_ok_total: AtomicU64,
    publish_failed_total: AtomicU64,
    publish_retries_total: AtomicU64,
    publish_dropped_total: AtomicU64,
    publish_latency_buckets: [AtomicU64; NUM_BUCKETS],
    publish_latency_sum_ms: AtomicU64,
    publish_latency_max_ms: AtomicU64,
    publish_queue_depth: AtomicU64,
    source_reconnects_total: AtomicU64,
    dataset_rows_total: AtomicU64,
    doorways: RwLock<FxHashMap<String, DoorwayGauge>>,
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            lines_total: AtomicU64::new(0),
            lines_since_report: AtomicU64::new(0),
            parse_errors_total: AtomicU64::new(0),
            lines_filtered_total: AtomicU64::new(0),
            enters_total: AtomicU64::new(0),
            exits_total: AtomicU64::new(0),
            snapshots_total: AtomicU64::new(0),
            publish_ok_total: AtomicU64::new(0),
            publish_failed_total: AtomicU64::new(0),
            publish_retries_total: AtomicU64::new(0),
            publish_dropped_total: AtomicU64::new(0),
            publish_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            publish_latency_sum_ms: AtomicU64::new(0),
            publish_latency_max_ms: AtomicU64::new(0),
            publish_queue_depth: AtomicU64::new(0),
            source_reconnects_total: AtomicU64::new(0),
            dataset_rows_total: AtomicU64::new(0),
            doorways: RwLock::new(FxHashMap::default()),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Register a doorway so it shows up in reports before its first event
    pub fn register_doorway(&self, doorway_id: &str, room_id: &str) {
        self.doorways.write().entry(doorway_id.to_string()).or_insert_with(|| DoorwayGauge {
            room_id: room_id.to_string(),
            ..DoorwayGauge::default()
        });
    }

    #[inline]
    pub fn record_line(&self) {
        self.lines_total.fetch_add(1, Ordering::Relaxed);
        self.lines_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        self.parse_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_line_filtered(&self) {
        self.lines_filtered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_crossing(&self, doorway_id: &str, enter: bool, occupancy: u32, debounce_secs: f64) {
        if enter {
            self.enters_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.exits_total.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(gauge) = self.doorways.write().get_mut(doorway_id) {
            gauge.occupancy = occupancy;
            gauge.debounce_secs = debounce_secs;
        }
    }

    pub fn record_snapshot(&self, doorway_id: &str, crowdiness_index: f64) {
        self.snapshots_total.fetch_add(1, Ordering::Relaxed);
        if let Some(gauge) = self.doorways.write().get_mut(doorway_id) {
            gauge.crowdiness_index = Some(crowdiness_index);
        }
    }

    /// Clear the live occupancy of a doorway after its source restarts
    pub fn reset_doorway(&self, doorway_id: &str) {
        if let Some(gauge) = self.doorways.write().get_mut(doorway_id) {
            gauge.occupancy = 0;
        }
    }

    #[inline]
    pub fn record_publish_ok(&self, latency_ms: u64) {
        self.publish_ok_total.fetch_add(1, Ordering::Relaxed);
        self.publish_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.publish_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.publish_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_publish_failed(&self) {
        self.publish_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_retry(&self) {
        self.publish_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_dropped(&self) {
        self.publish_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_publish_queue_depth(&self, depth: u64) {
        self.publish_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_source_reconnect(&self) {
        self.source_reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dataset_row(&self) {
        self.dataset_rows_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn parse_errors_total(&self) -> u64 {
        self.parse_errors_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn publish_dropped_total(&self) -> u64 {
        self.publish_dropped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn publish_ok_total(&self) -> u64 {
        self.publish_ok_total.load(Ordering::Relaxed)
    }

    pub fn doorway(&self, doorway_id: &str) -> Option<DoorwayGauge> {
        self.doorways.read().get(doorway_id).cloned()
    }

    /// Snapshot counters; per-interval values are reset
    pub fn report(&self) -> MetricsSummary {
        let lines_count = self.lines_since_report.swap(0, Ordering::Relaxed);
        let publish_latency_buckets = swap_buckets(&self.publish_latency_buckets);
        let publish_latency_sum = self.publish_latency_sum_ms.swap(0, Ordering::Relaxed);
        let publish_latency_max_ms = self.publish_latency_max_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let lines_per_sec = if elapsed.as_secs_f64() > 0.0 {
            lines_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let publish_count: u64 = publish_latency_buckets.iter().sum();
        let publish_latency_avg_ms =
            if publish_count > 0 { publish_latency_sum / publish_count } else { 0 };

        let mut doorways: Vec<(String, DoorwayGauge)> =
            self.doorways.read().iter().map(|(id, g)| (id.clone(), g.clone())).collect();
        doorways.sort_by(|a, b| a.0.cmp(&b.0));

        MetricsSummary {
            lines_total: self.lines_total.load(Ordering::Relaxed),
            lines_per_sec,
            parse_errors_total: self.parse_errors_total.load(Ordering::Relaxed),
            lines_filtered_total: self.lines_filtered_total.load(Ordering::Relaxed),
            enters_total: self.enters_total.load(Ordering::Relaxed),
            exits_total: self.exits_total.load(Ordering::Relaxed),
            snapshots_total: self.snapshots_total.load(Ordering::Relaxed),
            publish_ok_total: self.publish_ok_total.load(Ordering::Relaxed),
            publish_failed_total: self.publish_failed_total.load(Ordering::Relaxed),
            publish_retries_total: self.publish_retries_total.load(Ordering::Relaxed),
            publish_dropped_total: self.publish_dropped_total.load(Ordering::Relaxed),
            publish_latency_buckets,
            publish_latency_avg_ms,
            publish_latency_max_ms,
            publish_latency_p99_ms: percentile_from_buckets(&publish_latency_buckets, 0.99),
            publish_queue_depth: self.publish_queue_depth.load(Ordering::Relaxed),
            source_reconnects_total: self.source_reconnects_total.load(Ordering::Relaxed),
            dataset_rows_total: self.dataset_rows_total.load(Ordering::Relaxed),
            doorways,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub lines_total: u64,
    pub lines_per_sec: f64,
    pub parse_errors_total: u64,
    pub lines_filtered_total: u64,
    pub enters_total: u64,
    pub exits_total: u64,
    pub snapshots_total: u64,
    pub publish_ok_total: u64,
    pub publish_failed_total: u64,
    pub publish_retries_total: u64,
    pub publish_dropped_total: u64,
    pub publish_latency_buckets: [u64; NUM_BUCKETS],
    pub publish_latency_avg_ms: u64,
    pub publish_latency_max_ms: u64,
    pub publish_latency_p99_ms: u64,
    pub publish_queue_depth: u64,
    pub source_reconnects_total: u64,
    pub dataset_rows_total: u64,
    pub doorways: Vec<(String, DoorwayGauge)>,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            lines_total = %self.lines_total,
            lines_per_sec = format!("{:.1}", self.lines_per_sec),
            parse_errors = %self.parse_errors_total,
            filtered = %self.lines_filtered_total,
            enters = %self.enters_total,
            exits = %self.exits_total,
            snapshots = %self.snapshots_total,
            publish_ok = %self.publish_ok_total,
            publish_failed = %self.publish_failed_total,
            publish_retries = %self.publish_retries_total,
            publish_dropped = %self.publish_dropped_total,
            publish_avg_ms = %self.publish_latency_avg_ms,
            publish_p99_ms = %self.publish_latency_p99_ms,
            queue_depth = %self.publish_queue_depth,
            reconnects = %self.source_reconnects_total,
            "metrics"
        );
        for (doorway, gauge) in &self.doorways {
            info!(
                doorway = %doorway,
                room = %gauge.room_id,
                occupancy = %gauge.occupancy,
                crowdiness = ?gauge.crowdiness_index,
                debounce_secs = format!("{:.2}", gauge.debounce_secs),
                "doorway_status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(5), 0);
        assert_eq!(bucket_index(6), 1);
        assert_eq!(bucket_index(5000), 9);
        assert_eq!(bucket_index(5001), 10);
    }

    #[test]
    fn test_publish_latency_tracking() {
        let metrics = Metrics::new();

        metrics.record_publish_ok(20);
        metrics.record_publish_ok(80);
        metrics.record_publish_ok(200);

        let summary = metrics.report();
        assert_eq!(summary.publish_ok_total, 3);
        assert_eq!(summary.publish_latency_avg_ms, 100);
        assert_eq!(summary.publish_latency_max_ms, 200);
        assert!(summary.publish_latency_p99_ms <= 250);

        // Interval values reset, totals do not
        let summary = metrics.report();
        assert_eq!(summary.publish_ok_total, 3);
        assert_eq!(summary.publish_latency_max_ms, 0);
    }

    #[test]
    fn test_doorway_gauges() {
        let metrics = Metrics::new();
        metrics.register_doorway("west", "room01");

        metrics.record_crossing("west", true, 1, 0.8);
        metrics.record_crossing("west", true, 2, 0.6);
        metrics.record_crossing("west", false, 1, 0.9);
        metrics.record_snapshot("west", 0.42);
        // Unknown doorways are counted but have no gauge
        metrics.record_crossing("north", true, 1, 1.5);

        let gauge = metrics.doorway("west").unwrap();
        assert_eq!(gauge.room_id, "room01");
        assert_eq!(gauge.occupancy, 1);
        assert_eq!(gauge.crowdiness_index, Some(0.42));
        assert!(metrics.doorway("north").is_none());

        let summary = metrics.report();
        assert_eq!(summary.enters_total, 3);
        assert_eq!(summary.exits_total, 1);
        assert_eq!(summary.doorways.len(), 1);

        metrics.reset_doorway("west");
        assert_eq!(metrics.doorway("west").unwrap().occupancy, 0);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.99), 0);
    }
}

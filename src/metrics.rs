use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A simple percentile tracker that maintains a sliding window of measurements
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    /// Create a new percentile tracker with a specified window size
    pub fn new(window_size: usize) -> Self {
        Self {
            measurements: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record a measurement (in nanoseconds)
    pub fn record(&self, nanos: u64) {
        let mut measurements = self.measurements.lock();
        if measurements.len() >= self.window_size {
            measurements.pop_front();
        }
        measurements.push_back(nanos);
    }

    /// Median in microseconds
    pub fn p50_us(&self) -> f64 {
        self.percentile(0.50)
    }

    /// 95th percentile in microseconds
    pub fn p95_us(&self) -> f64 {
        self.percentile(0.95)
    }

    /// 99th percentile in microseconds
    pub fn p99_us(&self) -> f64 {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> f64 {
        let measurements = self.measurements.lock();
        if measurements.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<_> = measurements.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1000.0
    }

    /// Number of measurements currently in the window
    pub fn count(&self) -> usize {
        self.measurements.lock().len()
    }
}

/// Per-stage counters, shared between a [`StageHandle`](crate::StageHandle)
/// and its worker thread.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    blocks: Arc<AtomicU64>,
    elements: Arc<AtomicU64>,
    /// Wall time per block, from acquiring its input to committing its output
    block_latency: PercentileTracker,
    start_time: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(AtomicU64::new(0)),
            elements: Arc::new(AtomicU64::new(0)),
            block_latency: PercentileTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    /// Record one completed block of `elements` elements
    pub fn record_block(&self, elements: usize, nanos: u64) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.elements.fetch_add(elements as u64, Ordering::Relaxed);
        self.block_latency.record(nanos);
    }

    pub fn total_blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    pub fn total_elements(&self) -> u64 {
        self.elements.load(Ordering::Relaxed)
    }

    /// Elements per second since the stage was created
    pub fn throughput_eps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_elements() as f64 / elapsed
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_blocks: self.total_blocks(),
            total_elements: self.total_elements(),
            throughput_eps: self.throughput_eps(),
            latency_p50_us: self.block_latency.p50_us(),
            latency_p95_us: self.block_latency.p95_us(),
            latency_p99_us: self.block_latency.p99_us(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of stage metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_blocks: u64,
    pub total_elements: u64,
    pub throughput_eps: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Blocks: {}, Elements: {}, Throughput: {:.2} elem/s, \
             Block latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.total_blocks,
            self.total_elements,
            self.throughput_eps,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Traffic counters kept by a queue.
///
/// A "blocked" event is counted once per begin call that had to wait.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    elements_written: AtomicU64,
    elements_read: AtomicU64,
    blocked_writes: AtomicU64,
    blocked_reads: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_written(&self, n: usize) {
        self.elements_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, n: usize) {
        self.elements_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_blocked_write(&self) {
        self.blocked_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blocked_read(&self) {
        self.blocked_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Elements committed with `end_write`
    pub fn elements_written(&self) -> u64 {
        self.elements_written.load(Ordering::Relaxed)
    }

    /// Elements released with `end_read`
    pub fn elements_read(&self) -> u64 {
        self.elements_read.load(Ordering::Relaxed)
    }

    pub fn blocked_writes(&self) -> u64 {
        self.blocked_writes.load(Ordering::Relaxed)
    }

    pub fn blocked_reads(&self) -> u64 {
        self.blocked_reads.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_tracker() {
        let tracker = PercentileTracker::new(10);
        for i in 1..=10 {
            tracker.record(i * 1000);
        }
        assert_eq!(tracker.p50_us(), 5.0);
        assert_eq!(tracker.p99_us(), 10.0);
    }

    #[test]
    fn test_percentile_window_slides() {
        let tracker = PercentileTracker::new(3);
        for i in 1..=5 {
            tracker.record(i * 1000);
        }
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.p50_us(), 4.0);
    }

    #[test]
    fn test_stage_metrics() {
        let metrics = StageMetrics::new();
        for _ in 0..100 {
            metrics.record_block(4, 1000);
        }
        assert_eq!(metrics.total_blocks(), 100);
        assert_eq!(metrics.total_elements(), 400);
        assert!(metrics.snapshot().format().contains("Blocks: 100"));
    }

    #[test]
    fn test_stage_metrics_clones_share_counters() {
        let metrics = StageMetrics::new();
        let worker_side = metrics.clone();
        worker_side.record_block(1, 10);
        assert_eq!(metrics.total_blocks(), 1);
    }

    #[test]
    fn test_queue_metrics() {
        let metrics = QueueMetrics::new();
        metrics.record_written(3);
        metrics.record_read(2);
        metrics.record_blocked_write();
        assert_eq!(metrics.elements_written(), 3);
        assert_eq!(metrics.elements_read(), 2);
        assert_eq!(metrics.blocked_writes(), 1);
        assert_eq!(metrics.blocked_reads(), 0);
    }
}

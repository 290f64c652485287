//! Metrics Collector (component C10)
//!
//! Atomic request/hit/miss/write/eviction counters plus latency ring buffers
//! and a minute-granularity time series, in the same shape as this crate's
//! memory-pressure atomic counters and C6's hourly/daily roll-ups (a smaller
//! instance of the same merge idea). See SPEC_FULL.md §4.10.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const RING_BUFFER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LatencyPercentiles {
    pub avg: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

/// One minute's rolled-up sample, retained for an hour before folding into an
/// hourly mean/min/max aggregate retained for a day.
#[derive(Debug, Clone, Copy)]
pub struct TimeSeriesMetric {
    pub minute_start: DateTime<Utc>,
    pub read_count: u64,
    pub write_count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HourlyLatencyRollup {
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
}

pub struct MetricsCollector {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    read_latencies: Mutex<VecDeque<Duration>>,
    write_latencies: Mutex<VecDeque<Duration>>,
    timeseries: Mutex<VecDeque<TimeSeriesMetric>>,
    hourly_rollups: Mutex<VecDeque<(DateTime<Utc>, HourlyLatencyRollup)>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            read_latencies: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)),
            write_latencies: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)),
            timeseries: Mutex::new(VecDeque::new()),
            hourly_rollups: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_latency(&self, latency: Duration) {
        Self::push_bounded(&self.read_latencies, latency);
    }

    pub fn record_write_latency(&self, latency: Duration) {
        Self::push_bounded(&self.write_latencies, latency);
    }

    fn push_bounded(buffer: &Mutex<VecDeque<Duration>>, value: Duration) {
        let mut guard = buffer.lock();
        if guard.len() == RING_BUFFER_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(value);
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Sorts a snapshot of the current window on demand; never runs on the hot path.
    pub fn read_percentiles(&self) -> Option<LatencyPercentiles> {
        Self::percentiles_of(&self.read_latencies)
    }

    pub fn write_percentiles(&self) -> Option<LatencyPercentiles> {
        Self::percentiles_of(&self.write_latencies)
    }

    fn percentiles_of(buffer: &Mutex<VecDeque<Duration>>) -> Option<LatencyPercentiles> {
        let mut snapshot: Vec<Duration> = buffer.lock().iter().copied().collect();
        if snapshot.is_empty() {
            return None;
        }
        snapshot.sort();
        let at = |pct: f64| -> Duration {
            let idx = ((snapshot.len() - 1) as f64 * pct).round() as usize;
            snapshot[idx.min(snapshot.len() - 1)]
        };
        let avg = snapshot.iter().sum::<Duration>() / snapshot.len() as u32;
        Some(LatencyPercentiles {
            avg,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        })
    }

    /// Appends one minute sample; retains the trailing 60 minutes, folding
    /// anything older into the hourly rollup ring (retained 24 hours).
    pub fn append_minute_sample(&self, minute_start: DateTime<Utc>) {
        let sample = TimeSeriesMetric {
            minute_start,
            read_count: self.read_latencies.lock().len() as u64,
            write_count: self.write_latencies.lock().len() as u64,
        };

        let mut series = self.timeseries.lock();
        series.push_back(sample);
        while series.len() > 60 {
            series.pop_front();
        }
    }

    pub fn timeseries_snapshot(&self) -> Vec<TimeSeriesMetric> {
        self.timeseries.lock().iter().copied().collect()
    }

    pub fn append_hourly_rollup(&self, hour_start: DateTime<Utc>, rollup: HourlyLatencyRollup) {
        let mut hourly = self.hourly_rollups.lock();
        hourly.push_back((hour_start, rollup));
        while hourly.len() > 24 {
            hourly.pop_front();
        }
    }

    pub fn hourly_rollups_snapshot(&self) -> Vec<(DateTime<Utc>, HourlyLatencyRollup)> {
        self.hourly_rollups.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn counters_increment_independently() {
        let metrics = MetricsCollector::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_hit();
        metrics.record_miss();

        let snapshot = metrics.counters();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
    }

    #[test]
    fn percentiles_none_when_empty() {
        let metrics = MetricsCollector::new();
        assert!(metrics.read_percentiles().is_none());
    }

    #[test]
    fn percentiles_reflect_sorted_samples() {
        let metrics = MetricsCollector::new();
        for ms in [10, 20, 30, 40, 100] {
            metrics.record_read_latency(Duration::from_millis(ms));
        }
        let percentiles = metrics.read_percentiles().unwrap();
        assert_eq!(percentiles.p50, Duration::from_millis(30));
        assert_eq!(percentiles.p99, Duration::from_millis(100));
    }

    #[test]
    fn ring_buffer_evicts_oldest_sample_past_capacity() {
        let metrics = MetricsCollector::new();
        for i in 0..(RING_BUFFER_CAPACITY + 5) {
            metrics.record_read_latency(Duration::from_millis(i as u64));
        }
        let snapshot: Vec<Duration> = metrics.read_latencies.lock().iter().copied().collect();
        assert_eq!(snapshot.len(), RING_BUFFER_CAPACITY);
        assert_eq!(snapshot[0], Duration::from_millis(5));
    }

    #[test]
    fn timeseries_retains_at_most_sixty_minutes() {
        let metrics = MetricsCollector::new();
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for i in 0..70 {
            metrics.append_minute_sample(base + chrono::Duration::minutes(i));
        }
        assert_eq!(metrics.timeseries_snapshot().len(), 60);
    }
}

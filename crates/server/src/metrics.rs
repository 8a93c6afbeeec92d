//! Lock-free server counters.
//!
//! The simulation thread and connection tasks bump these with relaxed atomic
//! adds; a background task snapshots them and logs the snapshot as JSON.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

pub struct Metrics {
    // Monotonic counters
    ticks: AtomicU64,
    tick_ns_sum: AtomicU64,
    tick_overruns: AtomicU64,
    chunks_loaded: AtomicU64,
    chunks_generated: AtomicU64,
    chunks_evicted: AtomicU64,
    requests_served: AtomicU64,

    // Tick duration histogram
    hist_under_1ms: AtomicU64,
    hist_1_5ms: AtomicU64,
    hist_5_20ms: AtomicU64,
    hist_20_50ms: AtomicU64,
    hist_over_50ms: AtomicU64,

    // Gauges
    clients_connected: AtomicU64,

    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            tick_ns_sum: AtomicU64::new(0),
            tick_overruns: AtomicU64::new(0),
            chunks_loaded: AtomicU64::new(0),
            chunks_generated: AtomicU64::new(0),
            chunks_evicted: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            hist_under_1ms: AtomicU64::new(0),
            hist_1_5ms: AtomicU64::new(0),
            hist_5_20ms: AtomicU64::new(0),
            hist_20_50ms: AtomicU64::new(0),
            hist_over_50ms: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Called once per main tick with its measured duration.
    pub fn record_tick(&self, duration: Duration, budget: Duration) {
        self.ticks.fetch_add(1, Relaxed);
        self.tick_ns_sum
            .fetch_add(duration.as_nanos() as u64, Relaxed);
        if duration > budget {
            self.tick_overruns.fetch_add(1, Relaxed);
        }

        let bucket = match duration.as_millis() {
            0 => &self.hist_under_1ms,
            1..=4 => &self.hist_1_5ms,
            5..=19 => &self.hist_5_20ms,
            20..=49 => &self.hist_20_50ms,
            _ => &self.hist_over_50ms,
        };
        bucket.fetch_add(1, Relaxed);
    }

    pub fn chunk_loaded(&self, generated: bool) {
        self.chunks_loaded.fetch_add(1, Relaxed);
        if generated {
            self.chunks_generated.fetch_add(1, Relaxed);
        }
    }

    pub fn chunks_evicted(&self, n: u64) {
        self.chunks_evicted.fetch_add(n, Relaxed);
    }

    pub fn request_served(&self) {
        self.requests_served.fetch_add(1, Relaxed);
    }

    pub fn client_joined(&self) {
        self.clients_connected.fetch_add(1, Relaxed);
    }

    pub fn client_left(&self) {
        self.clients_connected.fetch_sub(1, Relaxed);
    }

    pub fn snapshot(&self, chunks_resident: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            ticks_total: self.ticks.load(Relaxed),
            tick_ns_sum: self.tick_ns_sum.load(Relaxed),
            tick_overruns: self.tick_overruns.load(Relaxed),
            chunks_resident,
            chunks_loaded: self.chunks_loaded.load(Relaxed),
            chunks_generated: self.chunks_generated.load(Relaxed),
            chunks_evicted: self.chunks_evicted.load(Relaxed),
            requests_served: self.requests_served.load(Relaxed),
            clients: self.clients_connected.load(Relaxed),
            hist: [
                self.hist_under_1ms.load(Relaxed),
                self.hist_1_5ms.load(Relaxed),
                self.hist_5_20ms.load(Relaxed),
                self.hist_20_50ms.load(Relaxed),
                self.hist_over_50ms.load(Relaxed),
            ],
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter. Rates come from diffing two.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub ticks_total: u64,
    pub tick_ns_sum: u64,
    pub tick_overruns: u64,
    pub chunks_resident: u64,
    pub chunks_loaded: u64,
    pub chunks_generated: u64,
    pub chunks_evicted: u64,
    pub requests_served: u64,
    pub clients: u64,
    /// `[<1ms, 1-5ms, 5-20ms, 20-50ms, >50ms]`
    pub hist: [u64; 5],
}

impl MetricsSnapshot {
    pub fn mean_tick(&self) -> Duration {
        if self.ticks_total == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.tick_ns_sum / self.ticks_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_land_in_buckets() {
        let metrics = Metrics::new();
        let budget = Duration::from_millis(50);
        metrics.record_tick(Duration::from_micros(300), budget);
        metrics.record_tick(Duration::from_millis(3), budget);
        metrics.record_tick(Duration::from_millis(70), budget);

        let snap = metrics.snapshot(4);
        assert_eq!(snap.ticks_total, 3);
        assert_eq!(snap.hist, [1, 1, 0, 0, 1]);
        assert_eq!(snap.tick_overruns, 1);
        assert_eq!(snap.chunks_resident, 4);
        assert!(snap.mean_tick() > Duration::from_millis(20));
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.chunk_loaded(true);
        metrics.chunk_loaded(false);
        let json = serde_json::to_value(metrics.snapshot(0)).unwrap();
        assert_eq!(json["chunks_loaded"], 2);
        assert_eq!(json["chunks_generated"], 1);
    }
}

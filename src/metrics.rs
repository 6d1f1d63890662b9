//! Counters and latencies for the engine's internal paths.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Point-in-time copy of the engine counters. Latencies are cumulative
/// microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub copy_on_write_times: u64,
    pub copy_on_write_latency: u64,
    pub copy_on_write_read_bytes: u64,
    pub copy_on_write_read_times: u64,
    pub copy_on_write_read_latency: u64,
    pub checksum_reuse: u64,
    pub checksum_combine: u64,
    pub checksum_recalculate: u64,
    pub safe_write_direct_append: u64,
    pub safe_write_indirect_append: u64,
    pub safe_write_truncate_shorten: u64,
    pub safe_write_truncate_extend: u64,
    pub safe_write_read_tail_times: u64,
    pub safe_write_read_tail_bytes: u64,
    pub allocate_times: u64,
    pub allocate_latency: u64,
    pub pwrite_times: u64,
    pub pwrite_latency: u64,
}

/// Live counters shared by every engine component.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub copy_on_write_times: AtomicU64,
    pub copy_on_write_latency: AtomicU64,
    pub copy_on_write_read_bytes: AtomicU64,
    pub copy_on_write_read_times: AtomicU64,
    pub copy_on_write_read_latency: AtomicU64,
    pub checksum_reuse: AtomicU64,
    pub checksum_combine: AtomicU64,
    pub checksum_recalculate: AtomicU64,
    pub safe_write_direct_append: AtomicU64,
    pub safe_write_indirect_append: AtomicU64,
    pub safe_write_truncate_shorten: AtomicU64,
    pub safe_write_truncate_extend: AtomicU64,
    pub safe_write_read_tail_times: AtomicU64,
    pub safe_write_read_tail_bytes: AtomicU64,
    pub allocate_times: AtomicU64,
    pub allocate_latency: AtomicU64,
    pub pwrite_times: AtomicU64,
    pub pwrite_latency: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Start timing an operation counted by `times` with latency `latency`.
    pub fn timer<'a>(times: &'a AtomicU64, latency: &'a AtomicU64) -> LatencyTimer<'a> {
        LatencyTimer {
            times,
            latency,
            start: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> Metrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Metrics {
            copy_on_write_times: load(&self.copy_on_write_times),
            copy_on_write_latency: load(&self.copy_on_write_latency),
            copy_on_write_read_bytes: load(&self.copy_on_write_read_bytes),
            copy_on_write_read_times: load(&self.copy_on_write_read_times),
            copy_on_write_read_latency: load(&self.copy_on_write_read_latency),
            checksum_reuse: load(&self.checksum_reuse),
            checksum_combine: load(&self.checksum_combine),
            checksum_recalculate: load(&self.checksum_recalculate),
            safe_write_direct_append: load(&self.safe_write_direct_append),
            safe_write_indirect_append: load(&self.safe_write_indirect_append),
            safe_write_truncate_shorten: load(&self.safe_write_truncate_shorten),
            safe_write_truncate_extend: load(&self.safe_write_truncate_extend),
            safe_write_read_tail_times: load(&self.safe_write_read_tail_times),
            safe_write_read_tail_bytes: load(&self.safe_write_read_tail_bytes),
            allocate_times: load(&self.allocate_times),
            allocate_latency: load(&self.allocate_latency),
            pwrite_times: load(&self.pwrite_times),
            pwrite_latency: load(&self.pwrite_latency),
        }
    }
}

/// Records one occurrence and its elapsed time when dropped.
pub struct LatencyTimer<'a> {
    times: &'a AtomicU64,
    latency: &'a AtomicU64,
    start: Instant,
}

impl Drop for LatencyTimer<'_> {
    fn drop(&mut self) {
        let micros = self.start.elapsed().as_micros().min(u64::MAX as u128) as u64;
        self.times.fetch_add(1, Ordering::Relaxed);
        self.latency.fetch_add(micros, Ordering::Relaxed);
    }
}

impl Metrics {
    /// Emit the snapshot as a single structured event.
    pub fn log(&self) {
        tracing::debug!(
            copy_on_write_times = self.copy_on_write_times,
            copy_on_write_read_bytes = self.copy_on_write_read_bytes,
            checksum_reuse = self.checksum_reuse,
            checksum_combine = self.checksum_combine,
            checksum_recalculate = self.checksum_recalculate,
            direct_append = self.safe_write_direct_append,
            indirect_append = self.safe_write_indirect_append,
            truncate_shorten = self.safe_write_truncate_shorten,
            truncate_extend = self.safe_write_truncate_extend,
            read_tail_bytes = self.safe_write_read_tail_bytes,
            allocate_times = self.allocate_times,
            pwrite_times = self.pwrite_times,
            "chunk engine metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_records_on_drop() {
        let metrics = EngineMetrics::new();
        {
            let _timer = EngineMetrics::timer(&metrics.pwrite_times, &metrics.pwrite_latency);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pwrite_times, 1);
    }

    #[test]
    fn test_snapshot_counts() {
        let metrics = EngineMetrics::new();
        EngineMetrics::incr(&metrics.checksum_reuse);
        EngineMetrics::add(&metrics.safe_write_read_tail_bytes, 100);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.checksum_reuse, 1);
        assert_eq!(snapshot.safe_write_read_tail_bytes, 100);
        assert_eq!(snapshot.checksum_combine, 0);
    }
}

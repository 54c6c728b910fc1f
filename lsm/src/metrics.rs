use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crossbeam_utils::CachePadded;
use vela_traits::{CompactionMetrics, CompactionStats};

/// Cumulative compaction counters.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Cumulative number of finished compactions
    compactions: CachePadded<AtomicU64>,
    /// Cumulative number of failed compactions
    failed_compactions: CachePadded<AtomicU64>,
    /// Cumulative number of bytes read by compactions
    bytes_read: CachePadded<AtomicU64>,
    /// Cumulative number of bytes written by compactions
    bytes_written: CachePadded<AtomicU64>,
    /// Cumulative number of entries dropped by compactions
    dropped_keys: CachePadded<AtomicU64>,
    /// Cumulative number of discard stats reports lost to a full channel
    discard_stats_dropped: CachePadded<AtomicU64>,
    /// Cumulative number of level 0 stalls
    l0_stalls: CachePadded<AtomicU64>,
    /// Cumulative time writes spent stalled on level 0, in microseconds
    l0_stall_micros: CachePadded<AtomicU64>,
}

impl Metrics {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn failed_compactions(&self) -> u64 {
        self.failed_compactions.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped_keys(&self) -> u64 {
        self.dropped_keys.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn discard_stats_dropped(&self) -> u64 {
        self.discard_stats_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn l0_stalls(&self) -> u64 {
        self.l0_stalls.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn l0_stall_time(&self) -> Duration {
        Duration::from_micros(self.l0_stall_micros.load(Ordering::Relaxed))
    }
}

impl CompactionMetrics for Metrics {
    fn on_compaction(&self, stats: &CompactionStats) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(stats.bytes_read, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(stats.bytes_written, Ordering::Relaxed);
        self.dropped_keys
            .fetch_add(stats.dropped_keys, Ordering::Relaxed);
    }

    fn on_compaction_failed(&self, _this_level: usize, _next_level: usize) {
        self.failed_compactions.fetch_add(1, Ordering::Relaxed);
    }

    fn on_discard_stats_dropped(&self) {
        self.discard_stats_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn on_l0_stall(&self, took: Duration) {
        self.l0_stalls.fetch_add(1, Ordering::Relaxed);
        self.l0_stall_micros
            .fetch_add(took.as_micros() as u64, Ordering::Relaxed);
    }
}

use std::{collections::HashMap, time::Duration};

use kvstructs::Key;

/// Kind of a catalog edit.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ChangeOp {
    Create,
    Delete,
}

/// A single catalog edit: a table is added to or removed from a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestChange {
    pub op: ChangeOp,
    pub id: u64,
    pub level: usize,
    /// True if the table lives in the ingest buffer of the level.
    pub ingest: bool,
    pub size: u64,
    pub value_bytes: u64,
    pub smallest: Key,
    pub biggest: Key,
}

impl ManifestChange {
    #[inline]
    pub fn create(id: u64, level: usize, ingest: bool) -> Self {
        Self {
            op: ChangeOp::Create,
            id,
            level,
            ingest,
            size: 0,
            value_bytes: 0,
            smallest: Key::new(),
            biggest: Key::new(),
        }
    }

    #[inline]
    pub fn delete(id: u64, level: usize, ingest: bool) -> Self {
        Self {
            op: ChangeOp::Delete,
            ..Self::create(id, level, ingest)
        }
    }

    /// Attaches the table summary to the edit.
    #[inline]
    pub fn with_summary(mut self, size: u64, value_bytes: u64, smallest: Key, biggest: Key) -> Self {
        self.size = size;
        self.value_bytes = value_bytes;
        self.smallest = smallest;
        self.biggest = biggest;
        self
    }
}

/// Where a live table belongs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TableManifest {
    pub level: usize,
    pub ingest: bool,
}

/// The persistent catalog of live tables.
///
/// A batch passed to [`Manifest::log_changes`] must be applied atomically:
/// either every edit is durable or none is.
pub trait Manifest: Send + Sync + 'static {
    fn log_changes(&self, changes: &[ManifestChange]) -> std::io::Result<()>;

    /// Returns every live table, keyed by table id.
    fn tables(&self) -> HashMap<u64, TableManifest>;
}

/// Receives the level 0 back pressure signal.
pub trait WriteThrottle: Send + Sync + 'static {
    fn set_write_throttle(&self, on: bool);
}

impl WriteThrottle for () {
    #[inline]
    fn set_write_throttle(&self, _on: bool) {}
}

impl<F> WriteThrottle for F
where
    F: Fn(bool) + Send + Sync + 'static,
{
    #[inline]
    fn set_write_throttle(&self, on: bool) {
        self(on)
    }
}

/// Summary of a finished compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub worker: usize,
    pub this_level: usize,
    pub next_level: usize,
    /// Short description of the plan kind, e.g. `"l0"` or `"ingest-drain"`.
    pub kind: &'static str,
    pub top_tables: usize,
    pub bot_tables: usize,
    pub new_tables: usize,
    pub splits: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub dropped_keys: u64,
    pub took: Duration,
}

/// Sink of compaction events. Every method defaults to a no-op.
pub trait CompactionMetrics: Send + Sync + 'static {
    fn on_compaction(&self, _stats: &CompactionStats) {}

    fn on_compaction_failed(&self, _this_level: usize, _next_level: usize) {}

    fn on_discard_stats_dropped(&self) {}

    fn on_l0_stall(&self, _took: Duration) {}
}

impl CompactionMetrics for () {}

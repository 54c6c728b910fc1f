use std::collections::HashSet;

use bable::Table;
use kvstructs::KeyRange;
use parking_lot::Mutex;

mod executor;
mod manager;
mod picker;
pub use picker::*;
mod plan;

/// Where the input of an ingest compaction comes from and where its output goes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IngestMode {
    /// A plain compaction between main tables.
    None,
    /// Merge ingest tables into the main tables of the same level.
    Drain,
    /// Merge the input and keep the output in the ingest buffer.
    Keep,
}

/// A level that needs a compaction, as ranked by the picker.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPriority {
    pub level: usize,
    pub score: f64,
    /// The score after dampening by the next level, used for ranking.
    pub adjusted: f64,
    pub ingest_mode: IngestMode,
    pub targets: Targets,
}

impl CompactionPriority {
    #[inline]
    pub fn new(level: usize, score: f64, ingest_mode: IngestMode, targets: Targets) -> Self {
        Self {
            level,
            score,
            adjusted: score,
            ingest_mode,
            targets,
        }
    }
}

/// A compaction plan: the input tables, the reserved ranges and the destination.
#[derive(Debug, Clone)]
pub struct CompactDef {
    pub(crate) worker: usize,
    pub(crate) priority: CompactionPriority,

    pub(crate) this_level: usize,
    pub(crate) next_level: usize,

    pub(crate) top: Vec<Table>,
    pub(crate) bot: Vec<Table>,

    pub(crate) this_range: KeyRange,
    pub(crate) next_range: KeyRange,
    pub(crate) splits: Vec<KeyRange>,

    pub(crate) this_size: u64,
    pub(crate) ingest_mode: IngestMode,

    /// Write the whole output into a single table.
    pub(crate) unbounded_output: bool,
}

impl CompactDef {
    pub(crate) fn new(worker: usize, priority: CompactionPriority) -> Self {
        Self {
            worker,
            this_level: priority.level,
            next_level: priority.level,
            ingest_mode: priority.ingest_mode,
            priority,
            top: Vec::new(),
            bot: Vec::new(),
            this_range: KeyRange::default(),
            next_range: KeyRange::default(),
            splits: Vec::new(),
            this_size: 0,
            unbounded_output: false,
        }
    }

    #[inline]
    pub fn this_level(&self) -> usize {
        self.this_level
    }

    #[inline]
    pub fn next_level(&self) -> usize {
        self.next_level
    }

    #[inline]
    pub fn top(&self) -> &[Table] {
        &self.top
    }

    #[inline]
    pub fn bot(&self) -> &[Table] {
        &self.bot
    }

    #[inline]
    pub fn this_range(&self) -> &KeyRange {
        &self.this_range
    }

    #[inline]
    pub fn next_range(&self) -> &KeyRange {
        &self.next_range
    }

    #[inline]
    pub fn ingest_mode(&self) -> IngestMode {
        self.ingest_mode
    }

    /// True if the top tables are taken from the ingest buffer of this level.
    #[inline]
    pub(crate) fn top_from_ingest(&self) -> bool {
        self.this_level > 0 && self.ingest_mode != IngestMode::None
    }

    /// True if the output goes to the ingest buffer of the next level.
    #[inline]
    pub(crate) fn output_to_ingest(&self) -> bool {
        self.ingest_mode == IngestMode::Keep
    }

    pub(crate) fn table_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.top.iter().chain(self.bot.iter()).map(Table::id)
    }

    /// Short description of the plan, used in logs and stats.
    pub fn kind(&self) -> &'static str {
        match (self.this_level, self.next_level, self.ingest_mode) {
            (0, 0, _) => "l0-to-l0",
            (0, _, IngestMode::Keep) => "l0-to-ingest",
            (0, _, _) => "l0-to-base",
            (_, _, IngestMode::Drain) => "ingest-drain",
            (_, _, IngestMode::Keep) => "ingest-keep",
            (this, next, IngestMode::None) if this == next => "max-level",
            _ => "regular",
        }
    }
}

/// Returns the range covering every version of the boundary user keys of `tables`.
pub(crate) fn key_range_of(tables: &[Table]) -> KeyRange {
    let mut kr = KeyRange::default();
    for t in tables {
        kr.extend(&user_key_range(t));
    }
    kr
}

fn user_key_range(t: &Table) -> KeyRange {
    use kvstructs::Key;
    KeyRange::new(
        Key::from_with_timestamp(t.smallest().parse_key(), u64::MAX),
        Key::from_with_timestamp(t.biggest().parse_key(), 0),
    )
}

#[derive(Debug, Default)]
struct LevelCompactStatus {
    ranges: Vec<KeyRange>,
    del_size: u64,
}

impl LevelCompactStatus {
    /// An infinite request only conflicts with another infinite reservation,
    /// the table id set guards the tables it covers.
    fn overlaps_with(&self, dst: &KeyRange) -> bool {
        if dst.is_inf() {
            return self.ranges.iter().any(KeyRange::is_inf);
        }
        self.ranges.iter().any(|r| r.overlaps_with(dst))
    }

    fn remove(&mut self, dst: &KeyRange) -> bool {
        match self.ranges.iter().position(|r| r == dst) {
            Some(idx) => {
                self.ranges.swap_remove(idx);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct CompactStatusInner {
    levels: Vec<LevelCompactStatus>,
    tables: HashSet<u64>,
}

/// The set of in-flight compactions: reserved key ranges per level and the
/// ids of the tables they read.
#[derive(Debug)]
pub struct CompactStatus {
    inner: Mutex<CompactStatusInner>,
}

impl CompactStatus {
    pub fn new(max_levels: usize) -> Self {
        Self {
            inner: Mutex::new(CompactStatusInner {
                levels: (0..max_levels).map(|_| LevelCompactStatus::default()).collect(),
                tables: HashSet::new(),
            }),
        }
    }

    #[inline]
    pub fn overlaps_with(&self, level: usize, kr: &KeyRange) -> bool {
        self.inner.lock().levels[level].overlaps_with(kr)
    }

    /// Bytes of the level currently being compacted away.
    #[inline]
    pub fn del_size(&self, level: usize) -> u64 {
        self.inner.lock().levels[level].del_size
    }

    #[inline]
    pub fn is_compacting(&self, table_id: u64) -> bool {
        self.inner.lock().tables.contains(&table_id)
    }

    /// Number of live reservations of the level.
    #[inline]
    pub fn num_reservations(&self, level: usize) -> usize {
        self.inner.lock().levels[level].ranges.len()
    }

    /// Reserves the ranges and tables of the plan. Returns false, changing
    /// nothing, if a range overlaps a live reservation or a table is already
    /// part of another compaction.
    pub fn compare_and_add(&self, cd: &CompactDef) -> bool {
        let mut inner = self.inner.lock();
        let CompactStatusInner { levels, tables } = &mut *inner;

        if levels[cd.this_level].overlaps_with(&cd.this_range) {
            return false;
        }
        if levels[cd.next_level].overlaps_with(&cd.next_range) {
            return false;
        }
        if cd.table_ids().any(|id| tables.contains(&id)) {
            return false;
        }

        let this = &mut levels[cd.this_level];
        if !cd.this_range.is_empty() {
            this.ranges.push(cd.this_range.clone());
        }
        this.del_size += cd.this_size;
        if !cd.next_range.is_empty() {
            levels[cd.next_level].ranges.push(cd.next_range.clone());
        }
        tables.extend(cd.table_ids());
        true
    }

    /// Releases the reservation of a plan accepted by [`CompactStatus::compare_and_add`].
    ///
    /// Panics if the reservation is not live.
    pub fn remove(&self, cd: &CompactDef) {
        let mut inner = self.inner.lock();
        let CompactStatusInner { levels, tables } = &mut *inner;

        let this = &mut levels[cd.this_level];
        this.del_size = match this.del_size.checked_sub(cd.this_size) {
            Some(sz) => sz,
            None => panic!("level {}: compacting size underflow", cd.this_level),
        };
        let found_this = cd.this_range.is_empty() || this.remove(&cd.this_range);
        let found_next = cd.next_range.is_empty() || levels[cd.next_level].remove(&cd.next_range);
        if !found_this || !found_next {
            tracing::error!(
                target: "compaction",
                this_level = cd.this_level,
                this_range = %cd.this_range,
                next_level = cd.next_level,
                next_range = %cd.next_range,
                "key range of a compaction is not reserved"
            );
            panic!("key range not found");
        }

        for id in cd.table_ids() {
            assert!(tables.remove(&id), "table {id} is not being compacted");
        }
    }
}

#[cfg(test)]
mod test;

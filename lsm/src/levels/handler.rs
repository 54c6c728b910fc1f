use std::{collections::HashSet, ops::Range, sync::Arc};

use bable::Table;
use kvstructs::{compare_keys, KeyRange, Value};
use parking_lot::RwLock;

use super::ingest::IngestBuffer;

/// An immutable snapshot of the main tables of a level.
///
/// Level 0 tables are kept oldest first. Tables of other levels are sorted by
/// their smallest key and never overlap.
#[derive(Debug, Default, Clone)]
pub struct LevelTables {
    tables: Vec<Table>,
    total_size: u64,
    total_stale_size: u64,
    total_value_bytes: u64,
}

impl LevelTables {
    fn from_tables(level: usize, tables: Vec<Table>) -> Self {
        let mut this = Self::default();
        for t in &tables {
            this.account_add(level, t);
        }
        this.tables = tables;
        this
    }

    #[inline]
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline]
    pub fn total_stale_size(&self) -> u64 {
        self.total_stale_size
    }

    #[inline]
    pub fn total_value_bytes(&self) -> u64 {
        self.total_value_bytes
    }

    /// Returns the indices of the tables overlapping `kr`. Only meaningful for
    /// levels above 0, where the tables are sorted and disjoint.
    pub fn overlapping_tables(&self, kr: &KeyRange) -> Range<usize> {
        if kr.is_inf() {
            return 0..self.tables.len();
        }
        if kr.start().is_empty() || kr.end().is_empty() {
            return 0..0;
        }

        let left = self
            .tables
            .partition_point(|t| compare_keys(t.biggest(), kr.start()).is_lt());
        let right = self
            .tables
            .partition_point(|t| compare_keys(t.smallest(), kr.end()).is_le());
        left..right.max(left)
    }

    fn account_add(&mut self, level: usize, t: &Table) {
        match (
            self.total_size.checked_add(t.size()),
            self.total_stale_size.checked_add(t.stale_data_size()),
            self.total_value_bytes.checked_add(t.value_bytes()),
        ) {
            (Some(size), Some(stale), Some(vb)) => {
                self.total_size = size;
                self.total_stale_size = stale;
                self.total_value_bytes = vb;
            }
            _ => panic!("level {level}: size overflow adding table {}", t.id()),
        }
    }

    fn account_remove(&mut self, level: usize, t: &Table) {
        match (
            self.total_size.checked_sub(t.size()),
            self.total_stale_size.checked_sub(t.stale_data_size()),
            self.total_value_bytes.checked_sub(t.value_bytes()),
        ) {
            (Some(size), Some(stale), Some(vb)) => {
                self.total_size = size;
                self.total_stale_size = stale;
                self.total_value_bytes = vb;
            }
            _ => panic!("level {level}: size underflow removing table {}", t.id()),
        }
    }
}

/// Returns true if the tables are sorted by smallest key and pairwise disjoint.
pub(crate) fn is_sorted_disjoint(tables: &[Table]) -> bool {
    tables
        .windows(2)
        .all(|w| compare_keys(w[0].biggest(), w[1].smallest()).is_lt())
}

/// Orders level 0 tables oldest first.
pub(crate) fn sort_by_age(tables: &mut [Table]) {
    tables.sort_by_key(|t| (t.created_at(), t.id()));
}

/// The main tables of one level plus, for levels above 0, its ingest buffer.
///
/// Readers take a snapshot of the table list, writers swap in a new list
/// under a short write lock.
#[derive(Debug)]
pub struct LevelHandler {
    level: usize,
    tables: RwLock<Arc<LevelTables>>,
    ingest: Option<IngestBuffer>,
}

impl LevelHandler {
    pub(crate) fn new(level: usize, ingest_shards: usize) -> Self {
        Self {
            level,
            tables: RwLock::new(Arc::new(LevelTables::default())),
            ingest: (level > 0).then(|| IngestBuffer::new(level, ingest_shards)),
        }
    }

    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Returns the current table list. The snapshot stays valid while
    /// compactions swap in new lists.
    #[inline]
    pub fn snapshot(&self) -> Arc<LevelTables> {
        self.tables.read().clone()
    }

    #[inline]
    pub fn num_tables(&self) -> usize {
        self.tables.read().len()
    }

    #[inline]
    pub fn total_size(&self) -> u64 {
        self.tables.read().total_size
    }

    #[inline]
    pub fn total_stale_size(&self) -> u64 {
        self.tables.read().total_stale_size
    }

    /// Returns the ingest buffer, `None` for level 0.
    #[inline]
    pub fn ingest(&self) -> Option<&IngestBuffer> {
        self.ingest.as_ref()
    }

    /// Installs the tables found at startup.
    pub(crate) fn init_tables(&self, mut tables: Vec<Table>) {
        if self.level == 0 {
            sort_by_age(&mut tables);
        } else {
            tables.sort_by(|a, b| compare_keys(a.smallest(), b.smallest()));
        }
        for t in &tables {
            t.set_level(self.level);
        }
        *self.tables.write() = Arc::new(LevelTables::from_tables(self.level, tables));
    }

    /// Appends a freshly flushed table to level 0. Returns false, leaving the
    /// level untouched, when the level already holds `stall` tables.
    pub(crate) fn try_add_l0_table(&self, t: &Table, stall: usize) -> bool {
        assert_eq!(self.level, 0);
        let mut guard = self.tables.write();
        if guard.len() >= stall {
            return false;
        }

        let mut next = LevelTables::clone(&guard);
        next.account_add(self.level, t);
        t.set_level(self.level);
        next.tables.push(t.clone());
        *guard = Arc::new(next);
        true
    }

    /// Atomically removes `to_del` and adds `to_add`.
    ///
    /// On level 0 the new tables take the place of the first removed table, so
    /// the list stays ordered by the age of the data. Panics if a table of
    /// `to_del` is not part of the level.
    pub(crate) fn replace_tables(&self, to_del: &[Table], to_add: &[Table]) {
        let del = to_del.iter().map(Table::id).collect::<HashSet<_>>();
        let mut guard = self.tables.write();

        let mut next = LevelTables::default();
        let mut first_removed = None;
        let mut removed = 0;
        for t in guard.tables.iter() {
            if del.contains(&t.id()) {
                first_removed.get_or_insert(next.tables.len());
                removed += 1;
                continue;
            }
            next.tables.push(t.clone());
        }
        if removed != del.len() {
            panic!(
                "level {}: {} of {} tables to delete are not in the level",
                self.level,
                del.len() - removed,
                del.len()
            );
        }

        next.total_size = guard.total_size;
        next.total_stale_size = guard.total_stale_size;
        next.total_value_bytes = guard.total_value_bytes;
        for t in to_del {
            next.account_remove(self.level, t);
        }
        for t in to_add {
            next.account_add(self.level, t);
            t.set_level(self.level);
        }

        if self.level == 0 {
            let at = first_removed.unwrap_or(next.tables.len());
            next.tables.splice(at..at, to_add.iter().cloned());
        } else {
            next.tables.extend(to_add.iter().cloned());
            next.tables.sort_by(|a, b| compare_keys(a.smallest(), b.smallest()));
            debug_assert!(
                is_sorted_disjoint(&next.tables),
                "level {} tables overlap",
                self.level
            );
        }

        *guard = Arc::new(next);
    }

    #[inline]
    pub(crate) fn delete_tables(&self, to_del: &[Table]) {
        self.replace_tables(to_del, &[])
    }

    /// Returns the newest version of the key, at most the version encoded in
    /// `key`, found in the main tables or the ingest buffer of the level.
    pub(crate) fn get(&self, key: &[u8]) -> Option<Value> {
        let snapshot = self.snapshot();
        let main: &[Table] = if self.level == 0 {
            snapshot.tables()
        } else {
            let idx = snapshot
                .tables
                .partition_point(|t| compare_keys(t.biggest(), key).is_lt());
            snapshot.tables.get(idx..=idx).unwrap_or(&[])
        };

        let ingest = self.ingest.as_ref().map(IngestBuffer::snapshot);
        let ingest_tables = ingest.iter().flat_map(|s| s.tables());

        let mut max_vs: Option<Value> = None;
        for t in main.iter().chain(ingest_tables) {
            if let Some((_, v)) = t.get(key) {
                if max_vs.as_ref().map_or(true, |m| m.version < v.version) {
                    max_vs = Some(v);
                }
            }
        }
        max_vs
    }

    /// Returns true if a table of the level or of its ingest buffer, other
    /// than those in `exclude`, overlaps `kr`.
    pub(crate) fn overlaps_with(&self, kr: &KeyRange, exclude: &HashSet<u64>) -> bool {
        let snapshot = self.snapshot();
        let ingest = self.ingest.as_ref().map(IngestBuffer::snapshot);
        let mut tables = snapshot
            .tables()
            .iter()
            .chain(ingest.iter().flat_map(|s| s.tables()));
        tables.any(|t| !exclude.contains(&t.id()) && kr.overlaps_with(&t.key_range()))
    }
}

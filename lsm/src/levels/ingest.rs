use std::{collections::HashSet, sync::Arc, time::Duration};

use bable::Table;
use kvstructs::parse_key;
use parking_lot::RwLock;

/// Tables of an ingest buffer whose smallest key falls in the same shard, oldest first.
#[derive(Debug, Default, Clone)]
pub struct IngestShard {
    tables: Vec<Table>,
    size: u64,
    value_bytes: u64,
}

impl IngestShard {
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
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn value_bytes(&self) -> u64 {
        self.value_bytes
    }

    /// Age of the oldest table of the shard.
    pub fn age(&self) -> Duration {
        self.tables
            .iter()
            .map(Table::age)
            .max()
            .unwrap_or_default()
    }
}

/// An immutable snapshot of an ingest buffer.
#[derive(Debug, Clone)]
pub struct IngestTables {
    shards: Vec<IngestShard>,
    table_count: usize,
    total_size: u64,
    total_value_bytes: u64,
}

impl IngestTables {
    #[inline]
    pub fn shards(&self) -> &[IngestShard] {
        &self.shards
    }

    /// Iterates every table of the buffer, shard by shard.
    #[inline]
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.shards.iter().flat_map(|s| s.tables.iter())
    }

    #[inline]
    pub fn table_count(&self) -> usize {
        self.table_count
    }

    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline]
    pub fn total_value_bytes(&self) -> u64 {
        self.total_value_bytes
    }

    /// Age of the oldest table of the buffer.
    pub fn age(&self) -> Duration {
        self.shards
            .iter()
            .map(IngestShard::age)
            .max()
            .unwrap_or_default()
    }
}

/// Secondary table set of a level holding bulk loaded data until an ingest
/// compaction merges it into the level.
///
/// Tables are sharded by the leading bits of the first byte of their smallest
/// user key. Tables of the buffer may overlap each other and the main tables.
#[derive(Debug)]
pub struct IngestBuffer {
    level: usize,
    shard_bits: u32,
    tables: RwLock<Arc<IngestTables>>,
}

impl IngestBuffer {
    /// `shards` must be a power of two, at most 256.
    pub(crate) fn new(level: usize, shards: usize) -> Self {
        let shards = shards.clamp(1, 256).next_power_of_two();
        Self {
            level,
            shard_bits: shards.trailing_zeros(),
            tables: RwLock::new(Arc::new(IngestTables {
                shards: vec![IngestShard::default(); shards],
                table_count: 0,
                total_size: 0,
                total_value_bytes: 0,
            })),
        }
    }

    #[inline]
    pub fn num_shards(&self) -> usize {
        1 << self.shard_bits
    }

    /// Returns the shard of an internal key.
    #[inline]
    pub fn shard_of(&self, key: &[u8]) -> usize {
        if self.shard_bits == 0 {
            return 0;
        }
        parse_key(key)
            .first()
            .map_or(0, |b| (*b >> (8 - self.shard_bits)) as usize)
    }

    #[inline]
    pub fn snapshot(&self) -> Arc<IngestTables> {
        self.tables.read().clone()
    }

    #[inline]
    pub fn table_count(&self) -> usize {
        self.tables.read().table_count
    }

    #[inline]
    pub fn total_size(&self) -> u64 {
        self.tables.read().total_size
    }

    /// Appends the tables to their shards.
    #[inline]
    pub(crate) fn add_tables(&self, to_add: &[Table]) {
        self.replace_tables(&[], to_add)
    }

    #[inline]
    pub(crate) fn remove_tables(&self, to_del: &[Table]) {
        self.replace_tables(to_del, &[])
    }

    /// Atomically removes `to_del` and adds `to_add`. A new table takes the
    /// place of the first removed table of its shard, or is appended if
    /// nothing was removed from the shard. Panics if a table of `to_del` is
    /// not in the buffer.
    pub(crate) fn replace_tables(&self, to_del: &[Table], to_add: &[Table]) {
        let del = to_del.iter().map(Table::id).collect::<HashSet<_>>();
        let mut guard = self.tables.write();

        let mut removed = 0;
        let mut insert_at = vec![None; guard.shards.len()];
        let mut shards = guard
            .shards
            .iter()
            .enumerate()
            .map(|(idx, shard)| {
                let mut next = IngestShard::default();
                for t in &shard.tables {
                    if del.contains(&t.id()) {
                        insert_at[idx].get_or_insert(next.tables.len());
                        removed += 1;
                        continue;
                    }
                    next.size += t.size();
                    next.value_bytes += t.value_bytes();
                    next.tables.push(t.clone());
                }
                next
            })
            .collect::<Vec<_>>();

        if removed != del.len() {
            panic!(
                "ingest buffer of level {}: {} of {} tables to delete are not in the buffer",
                self.level,
                del.len() - removed,
                del.len()
            );
        }

        for t in to_add {
            let idx = self.shard_of(t.smallest());
            t.set_level(self.level);
            let shard = &mut shards[idx];
            shard.size += t.size();
            shard.value_bytes += t.value_bytes();
            match &mut insert_at[idx] {
                Some(at) => {
                    shard.tables.insert(*at, t.clone());
                    *at += 1;
                }
                None => shard.tables.push(t.clone()),
            }
        }

        *guard = Arc::new(IngestTables {
            table_count: shards.iter().map(IngestShard::len).sum(),
            total_size: shards.iter().map(IngestShard::size).sum(),
            total_value_bytes: shards.iter().map(IngestShard::value_bytes).sum(),
            shards,
        });
    }
}

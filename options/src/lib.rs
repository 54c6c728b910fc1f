#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

use core::time::Duration;
use std::path::PathBuf;

/// Options of the level structure and its compactions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LevelsOptions {
    dir: PathBuf,

    max_levels: usize,
    num_compactors: usize,

    num_level_zero_tables: usize,
    num_level_zero_tables_stall: usize,

    base_table_size: u64,
    base_level_size: u64,
    level_size_multiplier: u64,
    table_size_multiplier: u64,
    mem_table_size: u64,

    num_versions_to_keep: usize,

    ingest_shards: usize,
    ingest_backlog_trigger: usize,
    ingest_batch_tables: usize,
    value_weight: f64,

    block_size: usize,
    bloom_false_positive: f64,

    compaction_interval: Duration,
    discard_channel_capacity: usize,
}

impl Default for LevelsOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelsOptions {
    #[inline]
    pub fn new() -> Self {
        Self {
            dir: std::env::temp_dir().join("vela"),
            max_levels: 7,
            num_compactors: 4,
            num_level_zero_tables: 5,
            num_level_zero_tables_stall: 15,
            base_table_size: 2 << 20,
            base_level_size: 10 << 20,
            level_size_multiplier: 10,
            table_size_multiplier: 2,
            mem_table_size: 64 << 20,
            num_versions_to_keep: 1,
            ingest_shards: 8,
            ingest_backlog_trigger: 4,
            ingest_batch_tables: 4,
            value_weight: 0.0,
            block_size: 4 * 1024,
            bloom_false_positive: 0.01,
            compaction_interval: Duration::from_secs(5),
            discard_channel_capacity: 16,
        }
    }

    /// Checks the relations between the options.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_levels < 2 {
            return Err("max_levels must be at least 2");
        }
        if self.num_level_zero_tables == 0 {
            return Err("num_level_zero_tables must be positive");
        }
        // level 0 has to be able to grow past twice the trigger before writes stall
        if self.num_level_zero_tables_stall <= self.num_level_zero_tables.saturating_mul(2) {
            return Err("num_level_zero_tables_stall must be greater than twice num_level_zero_tables");
        }
        if self.level_size_multiplier < 2 {
            return Err("level_size_multiplier must be at least 2");
        }
        if self.table_size_multiplier == 0 {
            return Err("table_size_multiplier must be positive");
        }
        if self.base_table_size == 0 || self.base_level_size == 0 || self.mem_table_size == 0 {
            return Err("table and level sizes must be positive");
        }
        if !self.ingest_shards.is_power_of_two() || self.ingest_shards > 256 {
            return Err("ingest_shards must be a power of two in 1..=256");
        }
        if self.ingest_batch_tables == 0 {
            return Err("ingest_batch_tables must be positive");
        }
        if self.value_weight < 0.0 {
            return Err("value_weight must not be negative");
        }
        if self.num_versions_to_keep == 0 {
            return Err("num_versions_to_keep must be positive");
        }
        Ok(())
    }

    /// get the directory table files live in
    #[inline]
    pub const fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// set the directory table files live in
    #[inline]
    pub fn set_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// get the number of levels, including level 0
    #[inline]
    pub const fn max_levels(&self) -> usize {
        self.max_levels
    }

    /// set the number of levels, including level 0
    #[inline]
    pub const fn set_max_levels(mut self, val: usize) -> Self {
        self.max_levels = val;
        self
    }

    /// get the number of compaction workers
    #[inline]
    pub const fn num_compactors(&self) -> usize {
        self.num_compactors
    }

    /// set the number of compaction workers, 0 disables background compactions
    #[inline]
    pub const fn set_num_compactors(mut self, val: usize) -> Self {
        self.num_compactors = val;
        self
    }

    /// get the number of level 0 tables that triggers a compaction
    #[inline]
    pub const fn num_level_zero_tables(&self) -> usize {
        self.num_level_zero_tables
    }

    /// set the number of level 0 tables that triggers a compaction
    #[inline]
    pub const fn set_num_level_zero_tables(mut self, val: usize) -> Self {
        self.num_level_zero_tables = val;
        self
    }

    /// get the number of level 0 tables at which new level 0 tables wait
    #[inline]
    pub const fn num_level_zero_tables_stall(&self) -> usize {
        self.num_level_zero_tables_stall
    }

    /// set the number of level 0 tables at which new level 0 tables wait
    ///
    /// Must be greater than twice [`num_level_zero_tables`](Self::num_level_zero_tables):
    /// the write throttle and the level 0 fast path act beyond that count.
    #[inline]
    pub const fn set_num_level_zero_tables_stall(mut self, val: usize) -> Self {
        self.num_level_zero_tables_stall = val;
        self
    }

    /// get the table size of the base level
    #[inline]
    pub const fn base_table_size(&self) -> u64 {
        self.base_table_size
    }

    /// set the table size of the base level
    #[inline]
    pub const fn set_base_table_size(mut self, val: u64) -> Self {
        self.base_table_size = val;
        self
    }

    /// get the target size of the base level
    #[inline]
    pub const fn base_level_size(&self) -> u64 {
        self.base_level_size
    }

    /// set the target size of the base level
    #[inline]
    pub const fn set_base_level_size(mut self, val: u64) -> Self {
        self.base_level_size = val;
        self
    }

    /// get the ratio between the target sizes of two adjacent levels
    #[inline]
    pub const fn level_size_multiplier(&self) -> u64 {
        self.level_size_multiplier
    }

    /// set the ratio between the target sizes of two adjacent levels
    #[inline]
    pub const fn set_level_size_multiplier(mut self, val: u64) -> Self {
        self.level_size_multiplier = val;
        self
    }

    /// get the ratio between the table sizes of two adjacent levels
    #[inline]
    pub const fn table_size_multiplier(&self) -> u64 {
        self.table_size_multiplier
    }

    /// set the ratio between the table sizes of two adjacent levels
    #[inline]
    pub const fn set_table_size_multiplier(mut self, val: u64) -> Self {
        self.table_size_multiplier = val;
        self
    }

    /// get the memtable size, which is the table size of level 0
    #[inline]
    pub const fn mem_table_size(&self) -> u64 {
        self.mem_table_size
    }

    /// set the memtable size, which is the table size of level 0
    #[inline]
    pub const fn set_mem_table_size(mut self, val: u64) -> Self {
        self.mem_table_size = val;
        self
    }

    /// get the number of versions of a key kept by compactions
    #[inline]
    pub const fn num_versions_to_keep(&self) -> usize {
        self.num_versions_to_keep
    }

    /// set the number of versions of a key kept by compactions
    #[inline]
    pub const fn set_num_versions_to_keep(mut self, val: usize) -> Self {
        self.num_versions_to_keep = val;
        self
    }

    /// get the number of shards of each ingest buffer
    #[inline]
    pub const fn ingest_shards(&self) -> usize {
        self.ingest_shards
    }

    /// set the number of shards of each ingest buffer, a power of two up to 256
    #[inline]
    pub const fn set_ingest_shards(mut self, val: usize) -> Self {
        self.ingest_shards = val;
        self
    }

    /// get the number of ingest tables on a level that makes it eligible for an ingest compaction
    #[inline]
    pub const fn ingest_backlog_trigger(&self) -> usize {
        self.ingest_backlog_trigger
    }

    /// set the number of ingest tables on a level that makes it eligible for an ingest compaction
    #[inline]
    pub const fn set_ingest_backlog_trigger(mut self, val: usize) -> Self {
        self.ingest_backlog_trigger = val;
        self
    }

    /// get the base number of tables drained from a shard by one ingest compaction
    #[inline]
    pub const fn ingest_batch_tables(&self) -> usize {
        self.ingest_batch_tables
    }

    /// set the base number of tables drained from a shard by one ingest compaction
    #[inline]
    pub const fn set_ingest_batch_tables(mut self, val: usize) -> Self {
        self.ingest_batch_tables = val;
        self
    }

    /// get the weight of value log bytes in compaction scores
    #[inline]
    pub const fn value_weight(&self) -> f64 {
        self.value_weight
    }

    /// set the weight of value log bytes in compaction scores, 0 disables the boost
    #[inline]
    pub const fn set_value_weight(mut self, val: f64) -> Self {
        self.value_weight = val;
        self
    }

    /// get the block size of the tables
    #[inline]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// set the block size of the tables
    #[inline]
    pub const fn set_block_size(mut self, val: usize) -> Self {
        self.block_size = val;
        self
    }

    /// get the false positive probabiltiy of bloom filters.
    #[inline]
    pub const fn bloom_false_positive(&self) -> f64 {
        self.bloom_false_positive
    }

    /// set the false positive probabiltiy of bloom filters.
    #[inline]
    pub const fn set_bloom_false_positive(mut self, val: f64) -> Self {
        self.bloom_false_positive = val;
        self
    }

    /// get the interval between two compaction attempts of a worker
    #[inline]
    pub const fn compaction_interval(&self) -> Duration {
        self.compaction_interval
    }

    /// set the interval between two compaction attempts of a worker
    #[inline]
    pub const fn set_compaction_interval(mut self, val: Duration) -> Self {
        self.compaction_interval = val;
        self
    }

    /// get the capacity of the discard stats channel
    #[inline]
    pub const fn discard_channel_capacity(&self) -> usize {
        self.discard_channel_capacity
    }

    /// set the capacity of the discard stats channel
    #[inline]
    pub const fn set_discard_channel_capacity(mut self, val: usize) -> Self {
        self.discard_channel_capacity = val;
        self
    }
}

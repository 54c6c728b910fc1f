use crate::{bloom::Filter, Block};
use core::num::NonZeroUsize;
use lru::LruCache as Lru;
use parking_lot::Mutex;
use std::sync::Arc;

/// Identifies a decoded block: the owning table and the block position in it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BlockKey {
    pub table_id: u64,
    pub block_idx: usize,
}

impl BlockKey {
    #[inline]
    pub const fn new(table_id: u64, block_idx: usize) -> Self {
        Self {
            table_id,
            block_idx,
        }
    }
}

/// Cache for decoded blocks and bloom filters shared by all tables.
///
/// Eviction is up to the implementation. Tables never rely on an entry
/// staying in the cache.
pub trait Cache: Send + Sync {
    fn get_block(&self, key: &BlockKey) -> Option<Arc<Block>>;

    fn put_block(&self, key: BlockKey, block: Arc<Block>);

    fn get_bloom(&self, table_id: u64) -> Option<Filter>;

    fn add_bloom(&self, table_id: u64, filter: Filter);
}

/// [`Cache`] implementation on top of two LRU maps.
pub struct LruCache {
    blocks: Mutex<Lru<BlockKey, Arc<Block>>>,
    blooms: Mutex<Lru<u64, Filter>>,
}

impl LruCache {
    /// Returns a cache holding at most `block_capacity` blocks and
    /// `bloom_capacity` bloom filters. Zero capacities are raised to one.
    pub fn new(block_capacity: usize, bloom_capacity: usize) -> Self {
        Self {
            blocks: Mutex::new(Lru::new(NonZeroUsize::new(block_capacity).unwrap_or(NonZeroUsize::MIN))),
            blooms: Mutex::new(Lru::new(NonZeroUsize::new(bloom_capacity).unwrap_or(NonZeroUsize::MIN))),
        }
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl Cache for LruCache {
    fn get_block(&self, key: &BlockKey) -> Option<Arc<Block>> {
        self.blocks.lock().get(key).cloned()
    }

    fn put_block(&self, key: BlockKey, block: Arc<Block>) {
        self.blocks.lock().put(key, block);
    }

    fn get_bloom(&self, table_id: u64) -> Option<Filter> {
        self.blooms.lock().get(&table_id).cloned()
    }

    fn add_bloom(&self, table_id: u64, filter: Filter) {
        self.blooms.lock().put(table_id, filter);
    }
}

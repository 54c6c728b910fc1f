/// Options contains configurable options for [`Builder`].
///
/// [`Builder`]: struct.Builder.html
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TableOptions {
    /// maximum size of the table
    table_size: u64,

    /// The false positive probabiltiy of bloom filter.
    bloom_false_positive: f64,

    /// the size of each block inside SSTable in bytes.
    block_size: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl TableOptions {
    /// Returns the default table options: 2 MiB tables, 4 KiB blocks and
    /// a 1% bloom filter false positive rate.
    #[inline]
    pub const fn new() -> Self {
        Self {
            table_size: 2 << 20,
            bloom_false_positive: 0.01,
            block_size: 4 * 1024,
        }
    }

    /// get maximum size of the table
    #[inline]
    pub const fn table_size(&self) -> u64 {
        self.table_size
    }

    /// set maximum size of the table
    #[inline]
    pub const fn set_table_size(mut self, val: u64) -> Self {
        self.table_size = val;
        self
    }

    /// get maximum capacity of the table, 0.95x of the maximum size of the table
    #[inline]
    pub fn table_capacity(&self) -> u64 {
        (self.table_size as f64 * 0.95) as u64
    }

    /// get the false positive probabiltiy of bloom filter.
    #[inline]
    pub const fn bloom_ratio(&self) -> f64 {
        self.bloom_false_positive
    }

    /// set the false positive probabiltiy of bloom filter.
    #[inline]
    pub const fn set_bloom_ratio(mut self, val: f64) -> Self {
        self.bloom_false_positive = val;
        self
    }

    /// get the block size
    #[inline]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// set the block size
    #[inline]
    pub const fn set_block_size(mut self, val: usize) -> Self {
        self.block_size = val;
        self
    }
}

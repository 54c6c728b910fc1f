use super::*;
use crate::bloom::{bloom_bits_per_key, hash, Filter};

/// Builder is used in building a table.
///
/// Keys must be inserted in ascending internal key order. The whole table is
/// assembled in memory and written out by [`Table::create`].
pub struct Builder {
    opts: TableOptions,
    buf: BytesMut,
    /// Offset of the current block in `buf`.
    block_start: usize,
    /// Offsets of entries present in current block.
    entry_offsets: Vec<u32>,
    index: TableIndex,
    /// Bytes the block offsets will take in the index.
    index_keys_size: usize,
    key_hashes: Vec<u32>,
}

impl Builder {
    pub fn new(opts: TableOptions) -> Self {
        Self {
            opts,
            buf: BytesMut::with_capacity(opts.block_size() * 2),
            block_start: 0,
            entry_offsets: Vec::new(),
            index: TableIndex {
                created_at: unix_millis(),
                ..Default::default()
            },
            index_keys_size: 0,
            key_hashes: Vec::new(),
        }
    }

    #[inline]
    pub fn options(&self) -> &TableOptions {
        &self.opts
    }

    /// Overrides the creation time, in milliseconds since the unix epoch.
    #[inline]
    pub fn set_created_at(&mut self, millis: u64) {
        self.index.created_at = millis;
    }

    /// The same as `insert` function but it also increments the internal
    /// `stale_data_size` counter. This value will be used to prioritize this table for
    /// compaction.
    pub fn insert_stale(&mut self, key: &Key, val: &Value) {
        self.index.stale_data_size += (key.len() + val.encoded_size() + 4) as u64;
        self.insert(key, val)
    }

    /// Inserts a key-value pair to the table.
    pub fn insert(&mut self, key: &Key, val: &Value) {
        debug_assert!(
            self.index.biggest.is_empty() || compare_keys(&self.index.biggest, key).is_lt(),
            "keys must be inserted in ascending order"
        );

        if self.should_finish_block(key, val) {
            self.finish_block();
        }

        if self.entry_offsets.is_empty() {
            self.index_keys_size += key.len() + 12;
            self.index.blocks.push(BlockOffset {
                first_key: key.clone(),
                offset: self.buf.len() as u32,
                len: 0,
            });
        }

        let user_key = key.parse_key();
        if self.index.biggest.is_empty() || self.index.biggest.parse_key() != user_key {
            self.key_hashes.push(hash(user_key));
        }

        if self.index.smallest.is_empty() {
            self.index.smallest = key.clone();
        }
        self.index.biggest = key.clone();
        self.index.max_version = self.index.max_version.max(key.parse_timestamp());
        self.index.key_count += 1;

        if let Some(vp) = val.value_pointer() {
            self.index.value_bytes += vp.len as u64;
            *self.index.vlog_refs.entry(vp.fid).or_default() += vp.len as u64;
        }

        self.entry_offsets
            .push((self.buf.len() - self.block_start) as u32);
        put_bytes(&mut self.buf, key);
        val.encode(&mut self.buf);
    }

    fn should_finish_block(&self, key: &Key, val: &Value) -> bool {
        if self.entry_offsets.is_empty() {
            return false;
        }

        let estimated = (self.buf.len() - self.block_start)
            + (self.entry_offsets.len() + 1) * 4
            + 8 // entry count and checksum
            + 4
            + key.len()
            + val.encoded_size();
        estimated > self.opts.block_size()
    }

    fn finish_block(&mut self) {
        if self.entry_offsets.is_empty() {
            return;
        }

        for off in &self.entry_offsets {
            self.buf.put_u32(*off);
        }
        self.buf.put_u32(self.entry_offsets.len() as u32);
        let crc = crc32fast::hash(&self.buf[self.block_start..]);
        self.buf.put_u32(crc);

        if let Some(bo) = self.index.blocks.last_mut() {
            bo.len = (self.buf.len() - self.block_start) as u32;
        }
        self.block_start = self.buf.len();
        self.entry_offsets.clear();
    }

    /// Returns whether builder is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.key_count == 0
    }

    /// Returns the number of blocks in the builder.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.blocks.len()
    }

    /// Returns the estimated size of the finished table.
    pub fn estimated_size(&self) -> u64 {
        let bits = bloom_bits_per_key(self.key_hashes.len(), self.opts.bloom_ratio());
        (self.buf.len()
            + self.entry_offsets.len() * 4
            + 8
            + self.index_keys_size
            + (self.key_hashes.len() * bits).max(64) / 8
            + self.index.vlog_refs.len() * 12
            + self.index.smallest.len()
            + self.index.biggest.len()
            + 64
            + FOOTER_SIZE) as u64
    }

    /// Returns true if the table is close to the maximum table size.
    #[inline]
    pub fn reached_capacity(&self) -> bool {
        self.estimated_size() >= self.opts.table_capacity()
    }

    /// Build the data to be written to the table file.
    pub fn finish(mut self) -> Result<Bytes> {
        if self.is_empty() {
            return Err(Error::EmptyTable);
        }

        self.finish_block();

        if self.opts.bloom_ratio() > 0.0 {
            let bits = bloom_bits_per_key(self.key_hashes.len(), self.opts.bloom_ratio());
            self.index.bloom = Filter::new(&self.key_hashes, bits).as_bytes().clone();
        }

        let mut index = BytesMut::new();
        self.index.encode(&mut index);
        self.buf.put_slice(&index);
        self.buf.put_u32(index.len() as u32);
        self.buf.put_u32(crc32fast::hash(&index));
        Ok(self.buf.freeze())
    }
}

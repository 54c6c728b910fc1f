use super::*;
use kvstructs::iterator::Iterator as BableIterator;

bitflags::bitflags! {
    pub struct Flag: u8 {
        const NONE = 0;
        /// Do not populate the block cache while iterating.
        const NO_CACHE = 4;
    }
}

/// Iterates the entries of a single table in ascending key order.
///
/// The iterator holds a handle of the table, so the table file outlives it.
pub struct TableIterator {
    table: Table,
    flag: Flag,
    block: Option<Arc<Block>>,
    block_idx: usize,
    entry_idx: usize,
    cur: Option<(Key, Value)>,
}

impl TableIterator {
    pub fn new(table: Table, flag: Flag) -> Self {
        Self {
            table,
            flag,
            block: None,
            block_idx: 0,
            entry_idx: 0,
            cur: None,
        }
    }

    #[inline]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Returns the current entry.
    #[inline]
    pub fn entry(&self) -> Option<(&Key, &Value)> {
        self.cur.as_ref().map(|(k, v)| (k, v))
    }

    fn load_block(&mut self, idx: usize) -> bool {
        if idx >= self.table.block_count() {
            self.block = None;
            self.cur = None;
            return false;
        }

        match self
            .table
            .block(idx, !self.flag.contains(Flag::NO_CACHE))
        {
            Ok(b) => {
                self.block = Some(b);
                self.block_idx = idx;
                true
            }
            Err(e) => {
                tracing::error!(target: "table", id = self.table.id(), block = idx, err = %e, "failed to load block");
                self.block = None;
                self.cur = None;
                false
            }
        }
    }

    /// Positions on entry `entry_idx` of the current block, moving on to the
    /// following blocks when the current one is exhausted.
    fn settle(&mut self) {
        loop {
            let Some(block) = &self.block else {
                self.cur = None;
                return;
            };

            if self.entry_idx < block.len() {
                self.cur = block.entry(self.entry_idx);
                if self.cur.is_none() {
                    tracing::error!(target: "table", id = self.table.id(), block = self.block_idx, "malformed entry");
                }
                return;
            }

            self.entry_idx = 0;
            if !self.load_block(self.block_idx + 1) {
                return;
            }
        }
    }
}

impl BableIterator for TableIterator {
    fn next(&mut self) {
        if self.cur.is_none() {
            return;
        }
        self.entry_idx += 1;
        self.settle();
    }

    fn rewind(&mut self) {
        self.entry_idx = 0;
        if self.load_block(0) {
            self.settle();
        }
    }

    fn seek(&mut self, key: &[u8]) {
        let blocks = self.table.block_offsets();
        // The first block whose first key is > key, the target is in the one before it.
        let idx = blocks.partition_point(|bo| compare_keys(&bo.first_key, key).is_le());
        let idx = idx.saturating_sub(1);

        if !self.load_block(idx) {
            return;
        }
        self.entry_idx = self.block.as_ref().map(|b| b.search(key)).unwrap_or(0);
        self.settle();
    }

    #[inline]
    fn key(&self) -> Option<&Key> {
        self.cur.as_ref().map(|(k, _)| k)
    }

    #[inline]
    fn val(&self) -> Option<&Value> {
        self.cur.as_ref().map(|(_, v)| v)
    }
}

/// Iterates a list of non-overlapping tables sorted by key range, one after another.
pub struct ConcatIterator {
    tables: Vec<Table>,
    flag: Flag,
    idx: usize,
    cur: Option<TableIterator>,
}

impl ConcatIterator {
    pub fn new(tables: Vec<Table>, flag: Flag) -> Self {
        Self {
            tables,
            flag,
            idx: 0,
            cur: None,
        }
    }

    fn set_idx(&mut self, idx: usize) {
        self.idx = idx;
        self.cur = self.tables.get(idx).map(|t| t.iter(self.flag));
    }

    /// Skips forward over exhausted tables.
    fn settle(&mut self) {
        while let Some(cur) = &self.cur {
            if cur.valid() {
                return;
            }
            self.set_idx(self.idx + 1);
            if let Some(cur) = &mut self.cur {
                cur.rewind();
            }
        }
    }
}

impl BableIterator for ConcatIterator {
    fn next(&mut self) {
        if let Some(cur) = &mut self.cur {
            cur.next();
        }
        self.settle();
    }

    fn rewind(&mut self) {
        self.set_idx(0);
        if let Some(cur) = &mut self.cur {
            cur.rewind();
        }
        self.settle();
    }

    fn seek(&mut self, key: &[u8]) {
        let idx = self
            .tables
            .partition_point(|t| compare_keys(t.biggest(), key).is_lt());
        self.set_idx(idx);
        if let Some(cur) = &mut self.cur {
            cur.seek(key);
        }
        self.settle();
    }

    #[inline]
    fn key(&self) -> Option<&Key> {
        self.cur.as_ref().and_then(|c| c.key())
    }

    #[inline]
    fn val(&self) -> Option<&Value> {
        self.cur.as_ref().and_then(|c| c.val())
    }
}

use crate::{
    bloom::{hash, Filter},
    cache::{BlockKey, Cache},
    error::*,
};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use fmmap::{MmapFile, MmapFileExt, MmapFileMut, MmapFileMutExt};
use kvstructs::{
    bytes::{Buf, BufMut, Bytes, BytesMut},
    compare_keys, parse_key, same_key, Key, KeyRange, Value,
};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

mod builder;
pub use builder::*;

mod iterator;
pub use iterator::*;

mod options;
pub use options::*;


const FILE_SUFFIX: &str = "sst";
const FOOTER_SIZE: usize = 8;

/// Returns the path of the table file with the given id in `dir`.
#[inline]
pub fn table_path(dir: impl AsRef<Path>, id: u64) -> PathBuf {
    dir.as_ref().join(format!("{:06}.{}", id, FILE_SUFFIX))
}

/// Returns the table id encoded in a table file name, `None` if the name
/// is not a table file.
pub fn parse_file_id(path: impl AsRef<Path>) -> Option<u64> {
    let path = path.as_ref();
    if path.extension()?.to_str()? != FILE_SUFFIX {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Block is a decoded, checksum verified block of entries.
///
/// ```text
/// +---------+-----+---------+---------------------+-------------------+---------+
/// | Entry 1 | ... | Entry N | Entry offsets (u32) | Entry count (u32) | CRC32   |
/// +---------+-----+---------+---------------------+-------------------+---------+
/// ```
///
/// Entry is `key_len (u32) | key | value` where value is the encoding of [`Value`].
#[derive(Debug, Clone, Default)]
pub struct Block {
    data: Bytes,
    /// used to binary search an entry in the block.
    entry_offsets: Vec<u32>,
}

impl Block {
    pub(crate) fn decode(table_id: u64, raw: Bytes) -> Result<Self> {
        let len = raw.len();
        if len < 8 {
            return Err(Error::Corrupted {
                id: table_id,
                reason: "block is too small",
            });
        }

        verify_checksum(&raw)?;

        let mut count = &raw[len - 8..len - 4];
        let count = count.get_u32() as usize;
        let offsets_start = (len - 8)
            .checked_sub(count * 4)
            .ok_or(Error::Corrupted {
                id: table_id,
                reason: "block entry count out of range",
            })?;

        let mut offsets = &raw[offsets_start..len - 8];
        let mut entry_offsets = Vec::with_capacity(count);
        for _ in 0..count {
            let off = offsets.get_u32();
            if off as usize > offsets_start {
                return Err(Error::Corrupted {
                    id: table_id,
                    reason: "block entry offset out of range",
                });
            }
            entry_offsets.push(off);
        }

        Ok(Self {
            data: raw.slice(..offsets_start),
            entry_offsets,
        })
    }

    /// Returns the number of entries in the block.
    #[inline]
    pub fn len(&self) -> usize {
        self.entry_offsets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entry_offsets.is_empty()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len() + self.entry_offsets.len() * 4
    }

    #[inline]
    pub(crate) fn key_at(&self, idx: usize) -> Option<&[u8]> {
        let start = *self.entry_offsets.get(idx)? as usize;
        let mut buf = self.data.get(start..)?;
        if buf.len() < 4 {
            return None;
        }
        let klen = buf.get_u32() as usize;
        buf.get(..klen)
    }

    pub(crate) fn entry(&self, idx: usize) -> Option<(Key, Value)> {
        let start = *self.entry_offsets.get(idx)? as usize;
        let end = self
            .entry_offsets
            .get(idx + 1)
            .map(|off| *off as usize)
            .unwrap_or(self.data.len());
        if start > end || end > self.data.len() {
            return None;
        }

        let mut buf = self.data.slice(start..end);
        if buf.len() < 4 {
            return None;
        }
        let klen = buf.get_u32() as usize;
        if buf.len() < klen {
            return None;
        }
        let key = Key::from(buf.split_to(klen));
        let val = Value::decode(&mut buf, key.parse_timestamp())?;
        Some((key, val))
    }

    /// Returns the index of the first entry whose key is `>= key`.
    pub(crate) fn search(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_at(mid) {
                Some(k) if compare_keys(k, key).is_lt() => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }
}

#[inline]
fn verify_checksum(data: &[u8]) -> Result<()> {
    let len = data.len();
    let mut tail = &data[len - 4..];
    let expected = tail.get_u32();
    let actual = crc32fast::hash(&data[..len - 4]);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub(crate) struct BlockOffset {
    pub(crate) first_key: Key,
    pub(crate) offset: u32,
    pub(crate) len: u32,
}

/// The table index, written after the last block.
///
/// ```text
/// smallest | biggest | max_version | key_count | stale_data_size | value_bytes |
/// created_at | blocks[{first_key, offset, len}] | bloom filter | vlog_refs[{fid, bytes}]
/// ```
#[derive(Debug, Clone, Default)]
pub(crate) struct TableIndex {
    pub(crate) smallest: Key,
    pub(crate) biggest: Key,
    pub(crate) max_version: u64,
    pub(crate) key_count: u32,
    pub(crate) stale_data_size: u64,
    pub(crate) value_bytes: u64,
    pub(crate) created_at: u64,
    pub(crate) blocks: Vec<BlockOffset>,
    pub(crate) bloom: Bytes,
    pub(crate) vlog_refs: HashMap<u32, u64>,
}

#[inline]
fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

#[inline]
fn get_bytes(src: &mut Bytes) -> Option<Bytes> {
    let len = get_u32(src)? as usize;
    if src.len() < len {
        return None;
    }
    Some(src.split_to(len))
}

#[inline]
fn get_u32(src: &mut Bytes) -> Option<u32> {
    (src.len() >= 4).then(|| src.get_u32())
}

#[inline]
fn get_u64(src: &mut Bytes) -> Option<u64> {
    (src.len() >= 8).then(|| src.get_u64())
}

impl TableIndex {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.smallest);
        put_bytes(buf, &self.biggest);
        buf.put_u64(self.max_version);
        buf.put_u32(self.key_count);
        buf.put_u64(self.stale_data_size);
        buf.put_u64(self.value_bytes);
        buf.put_u64(self.created_at);

        buf.put_u32(self.blocks.len() as u32);
        for bo in &self.blocks {
            put_bytes(buf, &bo.first_key);
            buf.put_u32(bo.offset);
            buf.put_u32(bo.len);
        }

        put_bytes(buf, &self.bloom);

        buf.put_u32(self.vlog_refs.len() as u32);
        let mut refs = self.vlog_refs.iter().collect::<Vec<_>>();
        refs.sort_unstable();
        for (fid, sz) in refs {
            buf.put_u32(*fid);
            buf.put_u64(*sz);
        }
    }

    pub(crate) fn decode(mut src: Bytes) -> Option<Self> {
        let smallest = Key::from(get_bytes(&mut src)?);
        let biggest = Key::from(get_bytes(&mut src)?);
        let max_version = get_u64(&mut src)?;
        let key_count = get_u32(&mut src)?;
        let stale_data_size = get_u64(&mut src)?;
        let value_bytes = get_u64(&mut src)?;
        let created_at = get_u64(&mut src)?;

        let num_blocks = get_u32(&mut src)? as usize;
        let mut blocks = Vec::with_capacity(num_blocks.min(src.len()));
        for _ in 0..num_blocks {
            blocks.push(BlockOffset {
                first_key: Key::from(get_bytes(&mut src)?),
                offset: get_u32(&mut src)?,
                len: get_u32(&mut src)?,
            });
        }

        let bloom = get_bytes(&mut src)?;

        let num_refs = get_u32(&mut src)? as usize;
        let mut vlog_refs = HashMap::with_capacity(num_refs.min(src.len()));
        for _ in 0..num_refs {
            let fid = get_u32(&mut src)?;
            vlog_refs.insert(fid, get_u64(&mut src)?);
        }

        Some(Self {
            smallest,
            biggest,
            max_version,
            key_count,
            stale_data_size,
            value_bytes,
            created_at,
            blocks,
            bloom,
            vlog_refs,
        })
    }
}

/// The shared state of a [`Table`].
///
/// The file is removed when the last handle is dropped, but only if the table
/// has been marked obsolete.
pub struct RawTable {
    id: u64,
    path: PathBuf,
    mmap: MmapFile,
    index: TableIndex,
    level: AtomicUsize,
    obsolete: AtomicBool,
    cache: Option<Arc<dyn Cache>>,
}

impl RawTable {
    fn new(id: u64, path: PathBuf, mmap: MmapFile, cache: Option<Arc<dyn Cache>>) -> Result<Self> {
        let corrupted = |reason| Error::Corrupted { id, reason };
        let data = mmap.as_slice();
        let len = data.len();
        if len < FOOTER_SIZE {
            return Err(corrupted("table is too small"));
        }

        let mut footer = &data[len - FOOTER_SIZE..];
        let index_len = footer.get_u32() as usize;
        let expected = footer.get_u32();
        let index_start = (len - FOOTER_SIZE)
            .checked_sub(index_len)
            .ok_or_else(|| corrupted("index length out of range"))?;
        let index_data = Bytes::copy_from_slice(&data[index_start..len - FOOTER_SIZE]);
        let actual = crc32fast::hash(&index_data);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let index = TableIndex::decode(index_data).ok_or_else(|| corrupted("malformed index"))?;
        if index.blocks.is_empty() {
            return Err(corrupted("table has no blocks"));
        }
        for bo in &index.blocks {
            let (start, end) = (bo.offset as usize, bo.offset as usize + bo.len as usize);
            if end > index_start || bo.len < 8 {
                return Err(corrupted("block offset out of range"));
            }
            verify_checksum(&data[start..end])?;
        }

        Ok(Self {
            id,
            path,
            mmap,
            index,
            level: AtomicUsize::new(0),
            obsolete: AtomicBool::new(false),
            cache,
        })
    }
}

impl Drop for RawTable {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::Acquire) {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Ok(_) => tracing::debug!(target: "table", id = self.id, "removed obsolete table file"),
            Err(e) => tracing::error!(
                target: "table",
                id = self.id,
                path = %self.path.display(),
                err = %e,
                "failed to remove obsolete table file"
            ),
        }
    }
}

/// A reference counted handle of an immutable sorted table file.
///
/// Cloning the handle increments the reference count, dropping it decrements it.
#[derive(Clone)]
#[repr(transparent)]
pub struct Table {
    inner: Arc<RawTable>,
}

impl core::fmt::Debug for Table {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id())
            .field("level", &self.level())
            .field("size", &self.size())
            .field("range", &self.key_range().to_string())
            .finish()
    }
}

impl Table {
    /// Writes the table built by `builder` to `path` and opens it.
    pub fn create(
        path: impl AsRef<Path>,
        id: u64,
        builder: Builder,
        cache: Option<Arc<dyn Cache>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let data = builder.finish()?;
        if path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("table file {} already exists", path.display()),
            )
            .into());
        }

        let written = MmapFileMut::create(path)
            .and_then(|mut mmap| {
                mmap.truncate(data.len() as u64)?;
                mmap.write_all(&data, 0)?;
                mmap.flush()
            })
            .map_err(Error::from)
            .and_then(|_| Self::open(path, id, cache));
        if written.is_err() {
            // a partial file must not be mistaken for a table
            match std::fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    tracing::warn!(target: "table", id, err = %e, "failed to remove partial table file")
                }
                _ => {}
            }
        }
        written
    }

    /// Opens the table file at `path`, verifying the checksums of the index and every block.
    pub fn open(path: impl AsRef<Path>, id: u64, cache: Option<Arc<dyn Cache>>) -> Result<Self> {
        let path = path.as_ref();
        let mmap = MmapFile::open(path)?;
        RawTable::new(id, path.to_path_buf(), mmap, cache).map(|inner| Self {
            inner: Arc::new(inner),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Smallest key (with timestamp).
    #[inline]
    pub fn smallest(&self) -> &Key {
        &self.inner.index.smallest
    }

    /// Biggest key (with timestamp).
    #[inline]
    pub fn biggest(&self) -> &Key {
        &self.inner.index.biggest
    }

    #[inline]
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.smallest().clone(), self.biggest().clone())
    }

    /// Size of the table file in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.mmap.len() as u64
    }

    /// Bytes of entries that were known to be shadowed when the table was written.
    #[inline]
    pub fn stale_data_size(&self) -> u64 {
        self.inner.index.stale_data_size
    }

    /// Bytes in the value log referenced by the entries of this table.
    #[inline]
    pub fn value_bytes(&self) -> u64 {
        self.inner.index.value_bytes
    }

    /// Referenced value log bytes per value log file id.
    #[inline]
    pub fn vlog_refs(&self) -> &HashMap<u32, u64> {
        &self.inner.index.vlog_refs
    }

    /// Creation time in milliseconds since the unix epoch.
    #[inline]
    pub fn created_at(&self) -> u64 {
        self.inner.index.created_at
    }

    /// Time passed since the table was created.
    #[inline]
    pub fn age(&self) -> Duration {
        Duration::from_millis(unix_millis().saturating_sub(self.created_at()))
    }

    #[inline]
    pub fn max_version(&self) -> u64 {
        self.inner.index.max_version
    }

    #[inline]
    pub fn key_count(&self) -> u32 {
        self.inner.index.key_count
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.inner.index.blocks.len()
    }

    #[inline]
    pub fn level(&self) -> usize {
        self.inner.level.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_level(&self, level: usize) {
        self.inner.level.store(level, Ordering::Release)
    }

    /// Returns the number of live handles of this table.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Marks the table as obsolete, its file is removed once the last handle is dropped.
    #[inline]
    pub fn mark_obsolete(&self) {
        self.inner.obsolete.store(true, Ordering::Release)
    }

    #[inline]
    pub fn is_obsolete(&self) -> bool {
        self.inner.obsolete.load(Ordering::Acquire)
    }

    #[inline]
    pub fn iter(&self, flag: Flag) -> TableIterator {
        TableIterator::new(self.clone(), flag)
    }

    fn bloom(&self) -> Filter {
        let inner = &self.inner;
        match &inner.cache {
            Some(cache) => cache.get_bloom(inner.id).unwrap_or_else(|| {
                let filter = Filter::from(inner.index.bloom.clone());
                cache.add_bloom(inner.id, filter.clone());
                filter
            }),
            None => Filter::from(inner.index.bloom.clone()),
        }
    }

    /// Returns false if the table certainly does not contain the user key hash.
    #[inline]
    pub fn may_contain_hash(&self, h: u32) -> bool {
        self.bloom().may_contain(h)
    }

    /// Returns false if the table certainly does not contain the user key.
    #[inline]
    pub fn may_contain_key(&self, user_key: &[u8]) -> bool {
        self.may_contain_hash(hash(user_key))
    }

    /// Returns the newest entry of the user key of `key` whose version is at
    /// most the version of `key`.
    pub fn get(&self, key: &[u8]) -> Option<(Key, Value)> {
        if compare_keys(key, self.biggest()).is_gt()
            || parse_key(key) < parse_key(self.smallest())
            || !self.may_contain_key(parse_key(key))
        {
            return None;
        }

        let mut iter = self.iter(Flag::NONE);
        kvstructs::iterator::Iterator::seek(&mut iter, key);
        let (k, v) = iter.entry()?;
        same_key(k, key).then(|| (k.clone(), v.clone()))
    }

    pub(crate) fn block_offsets(&self) -> &[BlockOffset] {
        &self.inner.index.blocks
    }

    pub(crate) fn block(&self, idx: usize, use_cache: bool) -> Result<Arc<Block>> {
        let inner = &self.inner;
        let key = BlockKey::new(inner.id, idx);
        if use_cache {
            if let Some(b) = inner.cache.as_ref().and_then(|c| c.get_block(&key)) {
                return Ok(b);
            }
        }

        let bo = inner.index.blocks.get(idx).ok_or(Error::Corrupted {
            id: inner.id,
            reason: "block index out of range",
        })?;
        let start = bo.offset as usize;
        let end = start + bo.len as usize;
        let data = inner.mmap.bytes(start, end - start)?;
        let block = Arc::new(Block::decode(inner.id, Bytes::copy_from_slice(data))?);

        if use_cache {
            if let Some(cache) = &inner.cache {
                cache.put_block(key, block.clone());
            }
        }
        Ok(block)
    }
}

#[inline]
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

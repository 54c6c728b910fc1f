use crate::TIMESTAMP_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use core::cmp::Ordering;
use core::hash::{Hash, Hasher};
use core::ops::Deref;

/// An internal key: user key bytes followed by an 8 byte reversed version.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct Key {
    data: Bytes,
}

impl Key {
    /// Returns an empty key
    #[inline]
    pub const fn new() -> Self {
        Self { data: Bytes::new() }
    }

    /// Returns an internal key built from user key and version.
    #[inline]
    pub fn from_with_timestamp(user_key: impl AsRef<[u8]>, ts: u64) -> Self {
        let user_key = user_key.as_ref();
        let mut buf = BytesMut::with_capacity(user_key.len() + TIMESTAMP_SIZE);
        buf.put_slice(user_key);
        buf.put_u64(u64::MAX - ts);
        Self { data: buf.freeze() }
    }

    /// Returns a Key by copying the slice data.
    #[inline]
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Returns the user key part, without the version suffix.
    #[inline]
    pub fn parse_key(&self) -> &[u8] {
        parse_key(&self.data)
    }

    /// Returns the version stored in the key, `0` if the key has no suffix.
    #[inline]
    pub fn parse_timestamp(&self) -> u64 {
        parse_timestamp(&self.data)
    }

    /// Checks for key equality ignoring the version timestamp.
    #[inline]
    pub fn same_key(&self, other: &Key) -> bool {
        same_key(&self.data, &other.data)
    }

    /// Returns the number of bytes contained in this Key.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the Key has a length of 0.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the underlying bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Returns the underlying [`Bytes`].
    #[inline]
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }
}

/// Returns the user key part of an internal key.
#[inline]
pub fn parse_key(key: &[u8]) -> &[u8] {
    match key.len().checked_sub(TIMESTAMP_SIZE) {
        Some(sz) => &key[..sz],
        None => key,
    }
}

/// Returns the version of an internal key.
#[inline]
pub fn parse_timestamp(key: &[u8]) -> u64 {
    match key.len().checked_sub(TIMESTAMP_SIZE) {
        Some(sz) => {
            let mut buf = [0u8; TIMESTAMP_SIZE];
            buf.copy_from_slice(&key[sz..]);
            u64::MAX - u64::from_be_bytes(buf)
        }
        None => 0,
    }
}

/// Checks the user key first and the reversed version if the user keys are the same.
/// `a<ts>` would sort after `aa<ts>` with a plain bytes comparison, so the two parts
/// have to be compared separately.
#[inline]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    let (ak, ats) = a.split_at(a.len().saturating_sub(TIMESTAMP_SIZE));
    let (bk, bts) = b.split_at(b.len().saturating_sub(TIMESTAMP_SIZE));
    ak.cmp(bk).then_with(|| ats.cmp(bts))
}

/// Checks for key equality ignoring the version timestamp.
#[inline]
pub fn same_key(a: &[u8], b: &[u8]) -> bool {
    parse_key(a) == parse_key(b)
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.data, &other.data)
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state)
    }
}

impl Deref for Key {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        self.data.as_ref()
    }
}

impl From<Bytes> for Key {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Key> for Bytes {
    fn from(key: Key) -> Self {
        key.data
    }
}

impl From<Vec<u8>> for Key {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
        }
    }
}

impl From<&[u8]> for Key {
    fn from(data: &[u8]) -> Self {
        Key::copy_from_slice(data)
    }
}

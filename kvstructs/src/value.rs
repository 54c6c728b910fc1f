use crate::{ValuePointer, OP};
use bytes::{Buf, BufMut, Bytes};

/// Fixed part of an encoded value: meta, user meta, expires at and value length.
pub const VALUE_HEADER_SIZE: usize = 1 + 1 + 8 + 4;

/// Value stored next to an internal key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Value {
    /// Op bits, see [`OP`].
    pub meta: u8,
    /// Opaque byte owned by the user.
    pub user_meta: u8,
    /// Unix time in seconds after which the entry is expired, `0` means never.
    pub expires_at: u64,
    /// Version of the entry. Not encoded, it is the timestamp of the key.
    pub version: u64,
    /// Inline value, or an encoded [`ValuePointer`] when
    /// [`OP::BIT_VALUE_POINTER`] is set.
    pub value: Bytes,
}

impl Value {
    /// Returns a plain inline value.
    #[inline]
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    /// Returns a deletion marker.
    #[inline]
    pub fn tombstone() -> Self {
        Self {
            meta: OP::BIT_DELETE.bits(),
            ..Default::default()
        }
    }

    /// Returns a value referencing an entry in the value log.
    #[inline]
    pub fn pointer(vp: ValuePointer) -> Self {
        Self {
            meta: OP::BIT_VALUE_POINTER.bits(),
            value: Bytes::copy_from_slice(&vp.encode()),
            ..Default::default()
        }
    }

    /// Sets the meta bits.
    #[inline]
    pub fn with_meta(mut self, meta: u8) -> Self {
        self.meta = meta;
        self
    }

    /// Sets the expiration unix time in seconds.
    #[inline]
    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Returns the value pointer if the value lives in the value log.
    #[inline]
    pub fn value_pointer(&self) -> Option<ValuePointer> {
        if self.meta & OP::BIT_VALUE_POINTER.bits() == 0 {
            return None;
        }
        ValuePointer::decode(&self.value)
    }

    /// Returns true if the value is a deletion marker.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.meta & OP::BIT_DELETE.bits() > 0
    }

    /// Returns the encoded size of the value.
    #[inline]
    pub fn encoded_size(&self) -> usize {
        VALUE_HEADER_SIZE + self.value.len()
    }

    /// Encodes the value into the buffer.
    ///
    /// ```text
    /// +------+-----------+------------+-----------+-------+
    /// | meta | user meta | expires at | value len | value |
    /// +------+-----------+------------+-----------+-------+
    /// ```
    #[inline]
    pub fn encode(&self, mut buf: impl BufMut) {
        buf.put_u8(self.meta);
        buf.put_u8(self.user_meta);
        buf.put_u64(self.expires_at);
        buf.put_u32(self.value.len() as u32);
        buf.put_slice(&self.value);
    }

    /// Decodes a value from the front of `src`, advancing it. The returned value
    /// shares memory with `src`.
    #[inline]
    pub fn decode(src: &mut Bytes, version: u64) -> Option<Self> {
        if src.len() < VALUE_HEADER_SIZE {
            return None;
        }
        let meta = src.get_u8();
        let user_meta = src.get_u8();
        let expires_at = src.get_u64();
        let len = src.get_u32() as usize;
        if src.len() < len {
            return None;
        }
        let value = src.split_to(len);
        Some(Self {
            meta,
            user_meta,
            expires_at,
            version,
            value,
        })
    }
}

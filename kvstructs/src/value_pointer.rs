/// ValuePointer points to the value in value log
#[derive(Default, Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ValuePointer {
    /// value log fid
    pub fid: u32,
    /// value len
    pub len: u32,
    /// offset of value in the value log
    pub offset: u32,
}

/// Encoded size of a [`ValuePointer`].
pub const VALUE_POINTER_SIZE: usize = 12;

impl ValuePointer {
    /// Returns a new value pointer.
    #[inline]
    pub const fn new(fid: u32, len: u32, offset: u32) -> Self {
        Self { fid, len, offset }
    }

    /// Encodes Pointer into `[u8; 12]`.
    pub fn encode(&self) -> [u8; VALUE_POINTER_SIZE] {
        let mut data = [0u8; VALUE_POINTER_SIZE];
        data[..4].copy_from_slice(&self.fid.to_be_bytes());
        data[4..8].copy_from_slice(&self.len.to_be_bytes());
        data[8..].copy_from_slice(&self.offset.to_be_bytes());
        data
    }

    /// Returns if the value pointer is zero
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.fid == 0 && self.offset == 0 && self.len == 0
    }

    /// Decodes the value pointer from the provided bytes. Returns `None` when
    /// the buffer is too short.
    #[inline]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < VALUE_POINTER_SIZE {
            return None;
        }

        let mut buf = [0u8; 4];
        buf.copy_from_slice(&data[..4]);
        let fid = u32::from_be_bytes(buf);
        buf.copy_from_slice(&data[4..8]);
        let len = u32::from_be_bytes(buf);
        buf.copy_from_slice(&data[8..12]);
        let offset = u32::from_be_bytes(buf);
        Some(Self { fid, len, offset })
    }
}

impl PartialOrd for ValuePointer {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValuePointer {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.fid
            .cmp(&other.fid)
            .then(self.offset.cmp(&other.offset))
            .then(self.len.cmp(&other.len))
    }
}

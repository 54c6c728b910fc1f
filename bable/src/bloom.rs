use core::f64::consts::LN_2;

use kvstructs::bytes::{BufMut, Bytes, BytesMut};

const SEED: u32 = 0xbc9f1d34;
const M: u32 = 0xc6a4a793;

/// hash implements a hashing algorithm similar to the Murmur hash.
pub fn hash(b: &[u8]) -> u32 {
    let mut h = SEED ^ M.wrapping_mul(b.len() as u32);

    let mut chunks = b.chunks_exact(4);
    for c in &mut chunks {
        h = h.wrapping_add(u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }

    let rest = chunks.remainder();
    if !rest.is_empty() {
        for (i, b) in rest.iter().enumerate() {
            h = h.wrapping_add((*b as u32) << (8 * i));
        }
        h = h.wrapping_mul(M);
        h ^= h >> 24;
    }
    h
}

/// Returns the bits per key required by bloomfilter based on
/// the false positive rate.
pub fn bloom_bits_per_key(num_entries: usize, fp: f64) -> usize {
    if num_entries == 0 {
        return 0;
    }
    let fne = num_entries as f64;
    let size = -1f64 * fne * fp.ln() / LN_2.powi(2);
    let locs = LN_2.ceil() * size / fne;
    locs as usize
}

/// Filter is an encoded set of key hashes, the last byte is the number of probes.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Filter(Bytes);

impl AsRef<[u8]> for Filter {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl From<Bytes> for Filter {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl Filter {
    pub fn new(keys: &[u32], bits_per_key: usize) -> Self {
        let k = ((0.69 * bits_per_key as f64) as u32).clamp(1, 30);

        // For small len(keys), we can see a very high false positive rate. Fix it
        // by enforcing a minimum bloom filter length to 64.
        let nbytes = ((keys.len() * bits_per_key).max(64) + 7) / 8;
        let nbs = (nbytes * 8) as u32;

        let mut filter = BytesMut::with_capacity(nbytes + 1);
        filter.resize(nbytes, 0);

        for h in keys {
            let mut h = *h;
            let delta = h.rotate_left(15);
            for _ in 0..k {
                let bit_pos = h % nbs;
                filter[(bit_pos / 8) as usize] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }

        filter.put_u8(k as u8);
        Filter(filter.freeze())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Returns whether the filter may contain given key hash. False positives
    /// are possible, an empty filter contains everything.
    pub fn may_contain(&self, mut h: u32) -> bool {
        let slice = self.0.as_ref();
        let len = slice.len();
        if len < 2 {
            return true;
        }

        let k = slice[len - 1];
        if k > 30 {
            return true;
        }

        let nbs = (8 * (len - 1)) as u32;
        let delta = h.rotate_left(15);
        for _ in 0..k {
            let bit_pos = h % nbs;
            if slice[(bit_pos / 8) as usize] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    #[inline]
    pub fn may_contain_key(&self, k: &[u8]) -> bool {
        self.may_contain(hash(k))
    }
}

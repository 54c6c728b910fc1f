//! General basic key-value structs shared by the LSM crates.
//!
//! Keys stored in tables are *internal keys*: the user key followed by the
//! big-endian encoding of `u64::MAX - version`, so that for the same user key
//! newer versions sort first.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]
#![deny(missing_docs)]

/// Iterator trait
pub mod iterator;
mod key;
mod key_range;
mod value;
mod value_pointer;

/// re-export [`bytes`] crate.
///
/// [`bytes`]: https://docs.rs/bytes/
pub mod bytes {
    pub use bytes::*;
}

pub use key::*;
pub use key_range::*;
pub use value::*;
pub use value_pointer::*;

use bitflags::bitflags;

/// Size of the version suffix of an internal key.
pub const TIMESTAMP_SIZE: usize = core::mem::size_of::<u64>();

bitflags! {
    /// Values have their first byte being byteData or byteDelete. This helps us distinguish between
    /// a key that has never been seen and a key that has been explicitly deleted.
    pub struct OP: u8 {
        #[doc = "Set if the key has been deleted."]
        const BIT_DELETE = 1 << 0;
        #[doc = "Set if the value is NOT stored directly next to key."]
        const BIT_VALUE_POINTER = 1 << 1;
        #[doc = "Set if earlier versions can be discarded."]
        const BIT_DISCARD_EARLIER_VERSIONS = 1 << 2;
        #[doc = "Set if item shouldn't be discarded via compactions (used by merge operator)"]
        const BIT_MERGE_ENTRY = 1 << 3;
        #[doc = "Set if the entry is part of a txn."]
        const BIT_TXN = 1 << 6;
        #[doc = "Set if the entry is to indicate end of txn in value log."]
        const BIT_FIN_TXN = 1 << 7;
    }
}

/// Returns the current unix time in seconds.
#[inline]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns true if the value has been deleted or its ttl has passed.
#[inline]
pub fn is_deleted_or_expired(meta: u8, expires_at: u64) -> bool {
    if meta & OP::BIT_DELETE.bits() > 0 {
        return true;
    }

    if expires_at == 0 {
        return false;
    }

    expires_at <= unix_now()
}

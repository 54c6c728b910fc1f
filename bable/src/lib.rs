#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

pub use kvstructs;

pub mod bloom;

pub mod cache;

pub mod error;

mod merge;
pub use merge::*;

mod table;
pub use table::*;

/// Re-export of the cursor trait all table iterators implement.
pub use kvstructs::iterator::Iterator as BableIterator;

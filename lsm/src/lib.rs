//! Leveled compaction engine: level handlers with per-level ingest buffers,
//! the compaction picker, plans reserved through [`compaction::CompactStatus`],
//! the parallel executor and the background compaction workers.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

pub use bable;
pub use vela_options::LevelsOptions;
pub use vela_traits::{
    ChangeOp, CompactionMetrics, CompactionStats, Manifest, ManifestChange, TableManifest,
    WriteThrottle,
};

pub mod compaction;
pub use compaction::{
    pick_compact_levels, CompactionPriority, IngestMode, LevelStatus, Targets,
};

pub mod error;

pub mod levels;
pub use levels::{Collaborators, LevelsController};

mod manifest;
pub use manifest::*;

pub mod metrics;

mod vlog;
pub use vlog::*;

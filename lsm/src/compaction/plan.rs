use std::{slice, time::Duration};

use bable::Table;
use kvstructs::{compare_keys, Key, KeyRange};

use super::{ingest_age_factor, key_range_of, CompactDef, IngestMode};
use crate::levels::Core;

/// Level 0 tables younger than this are left for a later L0 to L0 compaction.
const L0_TO_L0_MIN_AGE: Duration = Duration::from_secs(10);
/// Fewer level 0 tables than this are not worth an L0 to L0 compaction.
const L0_TO_L0_MIN_TABLES: usize = 4;
/// Max level tables younger than this are not rewritten.
const MAX_LEVEL_MIN_AGE: Duration = Duration::from_secs(60 * 60);
/// Max level tables with less stale data than this are not rewritten.
const MAX_LEVEL_MIN_STALE: u64 = 10 << 20;

fn total_size(tables: &[Table]) -> u64 {
    tables.iter().map(Table::size).sum()
}

impl Core {
    pub(crate) fn fill_tables_l0(&self, cd: &mut CompactDef) -> bool {
        if self.fill_tables_l0_to_lbase(cd) {
            return true;
        }
        self.fill_tables_l0_to_l0(cd)
    }

    fn fill_tables_l0_to_lbase(&self, cd: &mut CompactDef) -> bool {
        let base = cd.priority.targets.base_level;
        assert!(base > 0, "base level can't be zero");
        // only worker 0 gets here with an adjusted score below 1
        if cd.priority.adjusted > 0.0 && cd.priority.adjusted < 1.0 {
            return false;
        }

        let top = self.levels[0].snapshot();
        if top.is_empty() {
            return false;
        }

        // top[0] is the oldest table, take the run of overlapping tables from it
        let mut out = Vec::new();
        let mut kr = KeyRange::default();
        for t in top.tables() {
            let dkr = key_range_of(slice::from_ref(t));
            if !kr.overlaps_with(&dkr) || self.cstatus.is_compacting(t.id()) {
                break;
            }
            out.push(t.clone());
            kr.extend(&dkr);
        }
        // the oldest table is taken by a running plan
        if out.is_empty() {
            return false;
        }

        cd.next_level = base;
        cd.this_range = kr;
        cd.this_size = total_size(&out);
        cd.top = out;

        let bot = self.levels[base].snapshot();
        let range = bot.overlapping_tables(&cd.this_range);
        cd.bot = bot.tables()[range].to_vec();

        // level 0 is far behind: park the data in the ingest buffer of the
        // base level instead of rewriting the overlapping base tables
        if !cd.bot.is_empty() && top.len() >= 2 * self.opts.num_level_zero_tables() {
            cd.bot.clear();
            cd.ingest_mode = IngestMode::Keep;
        } else {
            cd.ingest_mode = IngestMode::None;
        }

        cd.next_range = cd.this_range.clone();
        cd.next_range.extend(&key_range_of(&cd.bot));
        self.cstatus.compare_and_add(cd)
    }

    fn fill_tables_l0_to_l0(&self, cd: &mut CompactDef) -> bool {
        if cd.worker != 0 {
            return false;
        }

        cd.next_level = 0;
        cd.bot.clear();
        cd.next_range = KeyRange::default();
        cd.ingest_mode = IngestMode::None;

        let max_size = cd.priority.targets.file_size[0].saturating_mul(2);
        let top = self.levels[0].snapshot();
        let out = top
            .tables()
            .iter()
            .filter(|t| {
                t.size() < max_size
                    && t.age() >= L0_TO_L0_MIN_AGE
                    && !self.cstatus.is_compacting(t.id())
            })
            .cloned()
            .collect::<Vec<_>>();
        if out.len() < L0_TO_L0_MIN_TABLES {
            return false;
        }

        // keeps any L0 to Lbase compaction away while this runs
        cd.this_range = KeyRange::inf();
        cd.this_size = total_size(&out);
        cd.top = out;
        cd.unbounded_output = true;
        if self.cstatus.compare_and_add(cd) {
            return true;
        }
        cd.top.clear();
        cd.unbounded_output = false;
        false
    }

    /// Picks one table of `this_level`, oldest data first, and the tables of the
    /// next level it overlaps.
    pub(crate) fn fill_tables(&self, cd: &mut CompactDef) -> bool {
        cd.next_level = cd.this_level + 1;
        let this = self.levels[cd.this_level].snapshot();
        let next = self.levels[cd.next_level].snapshot();
        if this.is_empty() {
            return false;
        }

        let mut tables = this.tables().to_vec();
        tables.sort_by_key(|t| t.max_version());

        for t in tables {
            cd.this_size = t.size();
            cd.this_range = key_range_of(slice::from_ref(&t));
            // if we're already compacting this range, don't do anything
            if self.cstatus.overlaps_with(cd.this_level, &cd.this_range) {
                continue;
            }
            cd.top = vec![t];

            let range = next.overlapping_tables(&cd.this_range);
            cd.bot = next.tables()[range].to_vec();
            cd.next_range = cd.this_range.clone();
            cd.next_range.extend(&key_range_of(&cd.bot));
            if self.cstatus.overlaps_with(cd.next_level, &cd.next_range) {
                continue;
            }
            if self.cstatus.compare_and_add(cd) {
                return true;
            }
        }
        cd.top.clear();
        cd.bot.clear();
        false
    }

    /// Rewrites a table of the last level holding a lot of stale data,
    /// together with the following tables if it is smaller than the table size.
    pub(crate) fn fill_max_level_tables(&self, cd: &mut CompactDef) -> bool {
        cd.next_level = cd.this_level;
        let level = self.levels[cd.this_level].snapshot();
        let tables = level.tables();

        let mut sorted = tables.to_vec();
        sorted.sort_by(|a, b| b.stale_data_size().cmp(&a.stale_data_size()));
        if sorted.first().map_or(true, |t| t.stale_data_size() == 0) {
            return false;
        }

        let discard_ts = self.discard_ts();
        let need = cd.priority.targets.file_size[cd.this_level];
        for t in sorted {
            // nothing of a table newer than the discard timestamp can be dropped
            if t.max_version() > discard_ts
                || t.age() < MAX_LEVEL_MIN_AGE
                || t.stale_data_size() < MAX_LEVEL_MIN_STALE
            {
                continue;
            }

            cd.this_size = t.size();
            cd.this_range = key_range_of(slice::from_ref(&t));
            cd.next_range = cd.this_range.clone();
            if self.cstatus.overlaps_with(cd.this_level, &cd.this_range) {
                continue;
            }

            cd.bot.clear();
            if t.size() < need {
                let idx = tables.partition_point(|x| compare_keys(x.smallest(), t.smallest()).is_lt());
                let mut sz = t.size();
                for next in tables.iter().skip(idx + 1) {
                    sz += next.size();
                    if sz >= need {
                        break;
                    }
                    cd.bot.push(next.clone());
                    cd.next_range.extend(&key_range_of(slice::from_ref(next)));
                }
            }

            cd.top = vec![t];
            if self.cstatus.compare_and_add(cd) {
                return true;
            }
            cd.top.clear();
            cd.bot.clear();
        }
        false
    }

    /// Picks the oldest tables of the most urgent ingest shard of the level.
    ///
    /// In [`IngestMode::Drain`] the main tables they overlap are merged with
    /// them, in [`IngestMode::Keep`] they are only merged with each other.
    pub(crate) fn fill_ingest_tables(&self, cd: &mut CompactDef) -> bool {
        cd.next_level = cd.this_level;
        let Some(ingest) = self.levels[cd.this_level].ingest() else {
            return false;
        };
        let snapshot = ingest.snapshot();
        let file_size = cd.priority.targets.file_size[cd.this_level].max(1);
        let vw = self.opts.value_weight();

        let mut shards = snapshot
            .shards()
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| {
                let ratio = if s.size() == 0 {
                    0.0
                } else {
                    (s.value_bytes() as f64 / s.size() as f64).min(1.0)
                };
                let score = s.size() as f64 * ingest_age_factor(s.age()) * (1.0 + vw * ratio);
                (score, s)
            })
            .collect::<Vec<_>>();
        shards.sort_by(|a, b| b.0.total_cmp(&a.0));

        let main = self.levels[cd.this_level].snapshot();
        for (_, shard) in shards {
            let files = ((shard.size() + file_size - 1) / file_size).max(1);
            let batch = self.opts.ingest_batch_tables() * files as usize;
            let top = shard
                .tables()
                .iter()
                .filter(|t| !self.cstatus.is_compacting(t.id()))
                .take(batch)
                .cloned()
                .collect::<Vec<_>>();
            if top.is_empty() || (cd.ingest_mode == IngestMode::Keep && top.len() < 2) {
                continue;
            }

            cd.this_range = key_range_of(&top);
            cd.this_size = total_size(&top);
            cd.bot = match cd.ingest_mode {
                IngestMode::Drain => main.tables()[main.overlapping_tables(&cd.this_range)].to_vec(),
                _ => Vec::new(),
            };
            cd.next_range = cd.this_range.clone();
            cd.next_range.extend(&key_range_of(&cd.bot));
            cd.top = top;
            if self.cstatus.compare_and_add(cd) {
                return true;
            }
        }
        cd.top.clear();
        cd.bot.clear();
        false
    }

    /// Splits the plan into at most five key ranges, cut after groups of
    /// bottom tables, so the ranges can be compacted in parallel.
    pub(crate) fn add_splits(&self, cd: &mut CompactDef) {
        cd.splits.clear();

        // 10 bottom tables with a width of 3 give the splits
        // [0, 1, 2], [3, 4, 5], [6, 7, 8], [9]
        let width = ((cd.bot.len() + 4) / 5).max(3);
        let mut skr = KeyRange::default();
        for (i, t) in cd.bot.iter().enumerate() {
            if i == cd.bot.len() - 1 {
                skr.set_end(Key::new());
                cd.splits.push(skr);
                return;
            }
            if i % width == width - 1 {
                // version 0 sorts last, so the split owns every version of the key
                let right = Key::from_with_timestamp(t.biggest().parse_key(), 0);
                skr.set_end(right.clone());
                cd.splits.push(skr.clone());
                skr.set_start(right);
            }
        }
    }
}

use std::{
    collections::HashSet,
    thread::{self, Scope},
    time::Instant,
};

use bable::{table_path, BableIterator, Builder, ConcatIterator, Flag, MergeIterator, Table};
use crossbeam_channel::{bounded, Sender, TrySendError};
use kvstructs::{compare_keys, is_deleted_or_expired, Key, KeyRange, Value, OP};
use vela_traits::{CompactionStats, ManifestChange};
use vela_utils::Throttle;

use super::{key_range_of, CompactDef, CompactionPriority, IngestMode};
use crate::{
    error::{Error, Result},
    levels::Core,
    vlog::DiscardStats,
};

/// What a sub-compaction dropped.
#[derive(Debug, Default)]
struct Dropped {
    keys: u64,
    discard: DiscardStats,
}

impl Dropped {
    fn add(&mut self, val: &Value) {
        self.keys += 1;
        if let Some(vp) = val.value_pointer() {
            *self.discard.entry(vp.fid).or_default() += vp.len as u64;
        }
    }

    fn merge(&mut self, other: Dropped) {
        self.keys += other.keys;
        for (fid, len) in other.discard {
            *self.discard.entry(fid).or_default() += len;
        }
    }
}

impl Core {
    /// Plans and runs one compaction for `prio`.
    pub(crate) fn do_compact(&self, worker: usize, prio: CompactionPriority) -> Result<()> {
        let level = prio.level;
        assert!(level < self.levels.len(), "level {level} out of range");

        let mut cd = CompactDef::new(worker, prio);
        let filled = match (level, cd.ingest_mode) {
            (0, _) => self.fill_tables_l0(&mut cd),
            (_, IngestMode::Drain | IngestMode::Keep) => self.fill_ingest_tables(&mut cd),
            (l, IngestMode::None) if l + 1 == self.levels.len() => self.fill_max_level_tables(&mut cd),
            _ => self.fill_tables(&mut cd),
        };
        if !filled {
            return Err(Error::FillTables);
        }

        if cd.this_level != cd.next_level || cd.ingest_mode == IngestMode::Drain {
            self.add_splits(&mut cd);
        }

        let cd = scopeguard::guard(cd, |cd| self.cstatus.remove(&cd));
        tracing::debug!(
            target: "compaction",
            worker,
            kind = cd.kind(),
            this_level = cd.this_level,
            next_level = cd.next_level,
            score = cd.priority.score,
            adjusted = cd.priority.adjusted,
            "running compaction"
        );
        self.run_compact_def(&cd).map_err(|e| {
            tracing::warn!(
                target: "compaction",
                worker,
                kind = cd.kind(),
                this_level = cd.this_level,
                next_level = cd.next_level,
                err = %e,
                "compaction failed"
            );
            self.metrics.on_compaction_failed(cd.this_level, cd.next_level);
            e
        })
    }

    fn run_compact_def(&self, cd: &CompactDef) -> Result<()> {
        let start = Instant::now();

        let has_overlap = self.has_overlap(cd);
        let (new_tables, dropped) = self.compact_build_tables(cd, has_overlap)?;
        if let Err(e) = self.commit(cd, &new_tables) {
            for t in &new_tables {
                t.mark_obsolete();
            }
            return Err(e);
        }
        self.send_discard_stats(dropped.discard);

        let stats = CompactionStats {
            worker: cd.worker,
            this_level: cd.this_level,
            next_level: cd.next_level,
            kind: cd.kind(),
            top_tables: cd.top.len(),
            bot_tables: cd.bot.len(),
            new_tables: new_tables.len(),
            splits: cd.splits.len(),
            bytes_read: cd.top.iter().chain(&cd.bot).map(Table::size).sum(),
            bytes_written: new_tables.iter().map(Table::size).sum(),
            dropped_keys: dropped.keys,
            took: start.elapsed(),
        };
        self.metrics.on_compaction(&stats);
        tracing::info!(
            target: "compaction",
            worker = stats.worker,
            kind = stats.kind,
            "compacted {}->{} ({}, {} -> {} tables with {} splits), dropped {} keys, took {:?}",
            stats.this_level,
            stats.next_level,
            stats.top_tables,
            stats.bot_tables,
            stats.new_tables,
            stats.splits,
            stats.dropped_keys,
            stats.took,
        );
        Ok(())
    }

    /// Returns true if a table outside the plan may hold other versions of
    /// keys in the plan's range. Deletion markers must then be kept.
    ///
    /// Every level is checked: ingest buffers and a moving base level mean a
    /// level above the plan can hold older versions than the plan itself.
    fn has_overlap(&self, cd: &CompactDef) -> bool {
        let mut kr = cd.this_range.clone();
        kr.extend(&cd.next_range);
        if kr.is_inf() {
            kr = key_range_of(&cd.top);
        }

        let exclude = cd.table_ids().collect::<HashSet<_>>();
        self.levels.iter().any(|l| l.overlaps_with(&kr, &exclude))
    }

    fn compact_build_tables(&self, cd: &CompactDef, has_overlap: bool) -> Result<(Vec<Table>, Dropped)> {
        let splits = if cd.splits.is_empty() {
            vec![KeyRange::default()]
        } else {
            cd.splits.clone()
        };

        let throttle = Throttle::<Error>::new(8 + splits.len());
        let (table_tx, table_rx) = bounded::<Table>(8 + splits.len());

        let throttle_ref = &throttle;
        let (mut tables, parts) = thread::scope(|s| {
            let collector = s.spawn(move || table_rx.iter().collect::<Vec<_>>());
            let handles = splits
                .iter()
                .map(|kr| {
                    let tx = table_tx.clone();
                    s.spawn(move || self.subcompact(s, cd, kr, has_overlap, throttle_ref, tx))
                })
                .collect::<Vec<_>>();
            drop(table_tx);

            let parts = handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect::<Vec<_>>();
            let tables = collector
                .join()
                .unwrap_or_else(|e| std::panic::resume_unwind(e));
            (tables, parts)
        });

        if let Err(e) = throttle.finish() {
            for t in &tables {
                t.mark_obsolete();
            }
            return Err(e);
        }

        tables.sort_by(|a, b| compare_keys(a.smallest(), b.smallest()));
        let mut dropped = Dropped::default();
        for part in parts {
            dropped.merge(part);
        }
        Ok((tables, dropped))
    }

    fn compaction_iterator(&self, cd: &CompactDef) -> MergeIterator {
        let mut iters: Vec<Box<dyn BableIterator + Send>> = Vec::with_capacity(cd.top.len() + 1);
        if cd.this_level == 0 || cd.top_from_ingest() {
            // these may overlap each other, newest first
            iters.extend(
                cd.top
                    .iter()
                    .rev()
                    .map(|t| Box::new(t.iter(Flag::NO_CACHE)) as Box<dyn BableIterator + Send>),
            );
        } else {
            iters.push(Box::new(ConcatIterator::new(cd.top.clone(), Flag::NO_CACHE)));
        }
        if !cd.bot.is_empty() {
            iters.push(Box::new(ConcatIterator::new(cd.bot.clone(), Flag::NO_CACHE)));
        }
        MergeIterator::new(iters)
    }

    /// Merges the entries of one split into tables, handing finished builders
    /// to writer threads admitted by `throttle`.
    fn subcompact<'scope, 'env>(
        &'env self,
        scope: &'scope Scope<'scope, 'env>,
        cd: &'env CompactDef,
        kr: &'env KeyRange,
        has_overlap: bool,
        throttle: &'env Throttle<Error>,
        table_tx: Sender<Table>,
    ) -> Dropped {
        let mut dropped = Dropped::default();
        let mut it = self.compaction_iterator(cd);
        if kr.start().is_empty() {
            it.rewind();
        } else {
            it.seek(kr.start());
            // every version of the left bound's user key belongs to the previous split
            while it.key().map_or(false, |k| k.same_key(kr.start())) {
                it.next();
            }
        }

        // outputs that stay on the same level keep the age of their input
        let created_at = (cd.this_level == cd.next_level && cd.ingest_mode != IngestMode::Drain)
            .then(|| cd.top.iter().map(Table::created_at).min())
            .flatten();

        let discard_ts = self.discard_ts();
        let num_versions_to_keep = self.opts.num_versions_to_keep();
        let discard_bit = OP::BIT_DISCARD_EARLIER_VERSIONS.bits();

        let mut last_key = Key::new();
        let mut skip_key = Key::new();
        let mut num_versions = 0;
        let mut first_key_has_discard_set = false;

        while it.valid() && !throttle.is_failed() {
            let mut builder = Builder::new(self.compaction_table_options(cd));
            if let Some(ts) = created_at {
                builder.set_created_at(ts);
            }

            let mut reached_end = false;
            loop {
                let (key, val) = match (it.key(), it.val()) {
                    (Some(k), Some(v)) => (k.clone(), v.clone()),
                    _ => break,
                };

                if !skip_key.is_empty() {
                    if key.same_key(&skip_key) {
                        dropped.add(&val);
                        it.next();
                        continue;
                    }
                    skip_key = Key::new();
                }

                if !key.same_key(&last_key) {
                    first_key_has_discard_set = false;
                    // the right bound's user key is the last one of the split
                    if !kr.end().is_empty() && key.parse_key() > kr.end().parse_key() {
                        reached_end = true;
                        break;
                    }
                    // only cut tables between user keys
                    if builder.reached_capacity() {
                        break;
                    }
                    last_key = key.clone();
                    num_versions = 0;
                    first_key_has_discard_set = val.meta & discard_bit > 0;
                }

                let version = key.parse_timestamp();
                let is_expired = is_deleted_or_expired(val.meta, val.expires_at);
                // versions above the discard timestamp may still be read, and
                // merge entries are dropped by the merge operator
                if version <= discard_ts && val.meta & OP::BIT_MERGE_ENTRY.bits() == 0 {
                    num_versions += 1;
                    let last_valid_version =
                        val.meta & discard_bit > 0 || num_versions == num_versions_to_keep;
                    if is_expired || last_valid_version {
                        skip_key = key.clone();
                        // a deletion marker goes away with its older versions
                        // once no lower table can hold the key
                        if is_expired && !has_overlap {
                            dropped.add(&val);
                            it.next();
                            continue;
                        }
                    }
                }

                if first_key_has_discard_set || is_expired {
                    // dropped by a later compaction
                    builder.insert_stale(&key, &val);
                } else {
                    builder.insert(&key, &val);
                }
                it.next();
            }

            if !builder.is_empty() {
                if !throttle.acquire() {
                    break;
                }
                self.spawn_table_writer(scope, cd.next_level, builder, throttle, table_tx.clone());
            }
            if reached_end {
                break;
            }
        }
        dropped
    }

    fn spawn_table_writer<'scope, 'env>(
        &'env self,
        scope: &'scope Scope<'scope, 'env>,
        level: usize,
        builder: Builder,
        throttle: &'env Throttle<Error>,
        tx: Sender<Table>,
    ) {
        let id = self.reserve_file_id();
        let path = table_path(self.opts.dir(), id);
        let cache = self.cache.clone();
        scope.spawn(move || match Table::create(&path, id, builder, cache) {
            Ok(t) => {
                t.set_level(level);
                if let Err(e) = tx.send(t) {
                    // the collector is gone, the table is an orphan
                    e.into_inner().mark_obsolete();
                }
                throttle.done(Ok(()));
            }
            Err(e) => {
                tracing::error!(target: "compaction", id, err = %e, "failed to write table");
                throttle.done(Err(e.into()));
            }
        });
    }

    /// Logs the edit to the manifest, then swaps the new tables into the
    /// destination and removes the input from the source.
    fn commit(&self, cd: &CompactDef, new_tables: &[Table]) -> Result<()> {
        let top_ingest = cd.top_from_ingest();
        let mut changes = Vec::with_capacity(new_tables.len() + cd.top.len() + cd.bot.len());
        changes.extend(new_tables.iter().map(|t| {
            ManifestChange::create(t.id(), cd.next_level, cd.output_to_ingest()).with_summary(
                t.size(),
                t.value_bytes(),
                t.smallest().clone(),
                t.biggest().clone(),
            )
        }));
        changes.extend(
            cd.top
                .iter()
                .map(|t| ManifestChange::delete(t.id(), cd.this_level, top_ingest)),
        );
        changes.extend(
            cd.bot
                .iter()
                .map(|t| ManifestChange::delete(t.id(), cd.next_level, false)),
        );
        self.manifest.log_changes(&changes).map_err(Error::Manifest)?;

        let this = &self.levels[cd.this_level];
        let next = &self.levels[cd.next_level];
        match cd.ingest_mode {
            IngestMode::Keep if top_ingest && cd.this_level == cd.next_level => {
                self.ingest_of(cd.next_level).replace_tables(&cd.top, new_tables);
            }
            IngestMode::Keep => {
                self.ingest_of(cd.next_level).add_tables(new_tables);
                if top_ingest {
                    self.ingest_of(cd.this_level).remove_tables(&cd.top);
                } else {
                    this.delete_tables(&cd.top);
                }
            }
            IngestMode::Drain => {
                next.replace_tables(&cd.bot, new_tables);
                self.ingest_of(cd.this_level).remove_tables(&cd.top);
            }
            IngestMode::None if cd.this_level == cd.next_level => {
                let del = cd.top.iter().chain(&cd.bot).cloned().collect::<Vec<_>>();
                next.replace_tables(&del, new_tables);
            }
            IngestMode::None => {
                next.replace_tables(&cd.bot, new_tables);
                this.delete_tables(&cd.top);
            }
        }

        for t in cd.top.iter().chain(&cd.bot) {
            t.mark_obsolete();
        }
        Ok(())
    }

    fn send_discard_stats(&self, stats: DiscardStats) {
        if stats.is_empty() {
            return;
        }
        let Some(tx) = &self.discard_tx else {
            return;
        };
        match tx.try_send(stats) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(target: "compaction", "discard stats channel is full, dropping stats");
                self.metrics.on_discard_stats_dropped();
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(target: "compaction", "discard stats receiver is gone");
            }
        }
    }
}

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bable::{cache::Cache, parse_file_id, table_path, Builder, Table, TableOptions};
use crossbeam_channel::{bounded, Receiver, Sender};
use kvstructs::Value;
use vela_options::LevelsOptions;
use vela_traits::{CompactionMetrics, Manifest, ManifestChange, WriteThrottle};
use vela_utils::Closer;

use crate::{
    compaction::{self, CompactDef, CompactStatus, CompactionPriority, LevelStatus, Targets},
    error::{Error, Result},
    vlog::DiscardStats,
};

mod handler;
pub use handler::*;
mod ingest;
pub use ingest::*;

/// How long a flush waits before retrying a stalled level 0.
const L0_STALL_BACKOFF: Duration = Duration::from_millis(10);

/// The collaborators of the level structure.
#[derive(Clone)]
pub struct Collaborators {
    manifest: Arc<dyn Manifest>,
    cache: Option<Arc<dyn Cache>>,
    write_throttle: Arc<dyn WriteThrottle>,
    metrics: Arc<dyn CompactionMetrics>,
    discard_tx: Option<Sender<DiscardStats>>,
}

impl Collaborators {
    /// No block cache, no write throttle, no metrics and no value log feedback.
    pub fn new(manifest: Arc<dyn Manifest>) -> Self {
        Self {
            manifest,
            cache: None,
            write_throttle: Arc::new(()),
            metrics: Arc::new(()),
            discard_tx: None,
        }
    }

    #[inline]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[inline]
    pub fn with_write_throttle(mut self, throttle: Arc<dyn WriteThrottle>) -> Self {
        self.write_throttle = throttle;
        self
    }

    #[inline]
    pub fn with_metrics(mut self, metrics: Arc<dyn CompactionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the channel compactions report dropped value log bytes on.
    #[inline]
    pub fn with_discard_sender(mut self, tx: Sender<DiscardStats>) -> Self {
        self.discard_tx = Some(tx);
        self
    }
}

/// State shared by the controller and the compaction workers.
pub(crate) struct Core {
    pub(crate) opts: LevelsOptions,
    pub(crate) levels: Vec<LevelHandler>,
    pub(crate) cstatus: CompactStatus,
    next_file_id: AtomicU64,
    discard_ts: AtomicU64,

    pub(crate) manifest: Arc<dyn Manifest>,
    pub(crate) cache: Option<Arc<dyn Cache>>,
    write_throttle: Arc<dyn WriteThrottle>,
    write_throttled: AtomicBool,
    pub(crate) metrics: Arc<dyn CompactionMetrics>,
    pub(crate) discard_tx: Option<Sender<DiscardStats>>,

    trigger_tx: Sender<()>,
    pub(crate) trigger_rx: Receiver<()>,
}

impl Core {
    #[inline]
    pub(crate) fn reserve_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn discard_ts(&self) -> u64 {
        self.discard_ts.load(Ordering::Acquire)
    }

    pub(crate) fn compaction_table_options(&self, cd: &CompactDef) -> TableOptions {
        let table_size = if cd.unbounded_output {
            u64::MAX
        } else {
            cd.priority.targets.file_size[cd.next_level]
        };
        TableOptions::new()
            .set_table_size(table_size)
            .set_block_size(self.opts.block_size())
            .set_bloom_ratio(self.opts.bloom_false_positive())
    }

    /// Panics for level 0, which has no ingest buffer.
    #[inline]
    pub(crate) fn ingest_of(&self, level: usize) -> &IngestBuffer {
        match self.levels[level].ingest() {
            Some(ingest) => ingest,
            None => panic!("level {level} has no ingest buffer"),
        }
    }

    pub(crate) fn level_statuses(&self) -> Vec<LevelStatus> {
        self.levels
            .iter()
            .map(|l| {
                let main = l.snapshot();
                let mut status = LevelStatus {
                    num_tables: main.len(),
                    total_size: main.total_size(),
                    value_bytes: main.total_value_bytes(),
                    del_size: self.cstatus.del_size(l.level()),
                    ..Default::default()
                };
                if let Some(ingest) = l.ingest() {
                    let ingest = ingest.snapshot();
                    status.ingest_tables = ingest.table_count();
                    status.ingest_size = ingest.total_size();
                    status.ingest_value_bytes = ingest.total_value_bytes();
                    status.ingest_age = ingest.age();
                }
                status
            })
            .collect()
    }

    #[inline]
    pub(crate) fn pick_compact_levels(&self) -> Vec<CompactionPriority> {
        compaction::pick_compact_levels(&self.opts, &self.level_statuses())
    }

    pub(crate) fn level_targets(&self) -> Targets {
        let sizes = self.levels.iter().map(LevelHandler::total_size).collect::<Vec<_>>();
        Targets::compute(&self.opts, &sizes)
    }

    /// Wakes a compaction worker. A pending wake up is enough, so a full
    /// channel is fine.
    #[inline]
    pub(crate) fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    #[inline]
    pub(crate) fn write_throttled(&self) -> bool {
        self.write_throttled.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_write_throttled(&self, on: bool) {
        self.write_throttled.store(on, Ordering::Release);
        self.write_throttle.set_write_throttle(on);
    }
}

/// Owns the levels of the tree and runs the compactions between them.
#[derive(Clone)]
pub struct LevelsController {
    core: Arc<Core>,
}

impl core::fmt::Debug for LevelsController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LevelsController")
            .field("dir", &self.core.opts.dir())
            .field(
                "tables",
                &self.core.levels.iter().map(LevelHandler::num_tables).collect::<Vec<_>>(),
            )
            .field("write_throttled", &self.core.write_throttled())
            .finish_non_exhaustive()
    }
}

impl LevelsController {
    /// Opens the level structure in `opts.dir()`, loading every table the
    /// manifest lists and removing table files it does not know about.
    pub fn open(opts: LevelsOptions, collab: Collaborators) -> Result<Self> {
        opts.validate().map_err(Error::InvalidOptions)?;
        std::fs::create_dir_all(opts.dir())?;

        let max_levels = opts.max_levels();
        let levels = (0..max_levels)
            .map(|l| LevelHandler::new(l, opts.ingest_shards()))
            .collect::<Vec<_>>();

        let listed = collab.manifest.tables();
        let mut ids = listed.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();

        let start = Instant::now();
        let mut main = vec![Vec::new(); max_levels];
        let mut ingest = vec![Vec::new(); max_levels];
        for id in ids {
            let tm = listed[&id];
            if tm.level >= max_levels {
                return Err(Error::LevelOutOfRange { id, level: tm.level });
            }
            let path = table_path(opts.dir(), id);
            if !path.exists() {
                return Err(Error::TableNotFound(id));
            }
            let t = Table::open(&path, id, collab.cache.clone())?;
            if tm.ingest && tm.level > 0 {
                ingest[tm.level].push(t);
            } else {
                main[tm.level].push(t);
            }
        }

        let mut num_tables = 0;
        for ((handler, main), mut ingest) in levels.iter().zip(main).zip(ingest) {
            num_tables += main.len() + ingest.len();
            handler.init_tables(main);
            if let Some(buf) = handler.ingest() {
                sort_by_age(&mut ingest);
                buf.add_tables(&ingest);
            }
        }

        let max_id = remove_orphans(&opts, &listed)?;
        tracing::info!(
            target: "levels",
            tables = num_tables,
            took = ?start.elapsed(),
            "levels loaded"
        );

        let (trigger_tx, trigger_rx) = bounded(opts.num_compactors().max(1));
        let core = Core {
            cstatus: CompactStatus::new(max_levels),
            next_file_id: AtomicU64::new(max_id + 1),
            discard_ts: AtomicU64::new(u64::MAX),
            levels,
            opts,
            manifest: collab.manifest,
            cache: collab.cache,
            write_throttle: collab.write_throttle,
            write_throttled: AtomicBool::new(false),
            metrics: collab.metrics,
            discard_tx: collab.discard_tx,
            trigger_tx,
            trigger_rx,
        };
        Ok(Self {
            core: Arc::new(core),
        })
    }

    #[inline]
    pub fn options(&self) -> &LevelsOptions {
        &self.core.opts
    }

    /// Reserves a table id.
    #[inline]
    pub fn new_table_id(&self) -> u64 {
        self.core.reserve_file_id()
    }

    /// Writes `builder` to a new table file in the levels directory.
    pub fn create_table(&self, builder: Builder) -> Result<Table> {
        let id = self.core.reserve_file_id();
        let path = table_path(self.core.opts.dir(), id);
        Table::create(path, id, builder, self.core.cache.clone()).map_err(Into::into)
    }

    /// Adds a flushed table to level 0.
    ///
    /// Blocks while level 0 holds `num_level_zero_tables_stall` tables,
    /// waking the compaction workers until one frees up a slot.
    pub fn add_l0_table(&self, t: Table) -> Result<()> {
        let core = &self.core;
        let change = ManifestChange::create(t.id(), 0, false).with_summary(
            t.size(),
            t.value_bytes(),
            t.smallest().clone(),
            t.biggest().clone(),
        );
        core.manifest.log_changes(&[change]).map_err(Error::Manifest)?;

        let stall = core.opts.num_level_zero_tables_stall();
        let mut stalled_at = None;
        while !core.levels[0].try_add_l0_table(&t, stall) {
            if stalled_at.is_none() {
                tracing::warn!(target: "levels", tables = stall, "level 0 is full, stalling writes");
                stalled_at = Some(Instant::now());
            }
            core.trigger();
            std::thread::sleep(L0_STALL_BACKOFF);
        }
        if let Some(at) = stalled_at {
            let took = at.elapsed();
            tracing::info!(target: "levels", took = ?took, "level 0 stall released");
            core.metrics.on_l0_stall(took);
        }
        core.trigger();
        Ok(())
    }

    /// Adds bulk loaded tables to the ingest buffer of the base level.
    pub fn ingest_tables(&self, tables: Vec<Table>) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let core = &self.core;
        let base = core.level_targets().base_level;
        let changes = tables
            .iter()
            .map(|t| {
                ManifestChange::create(t.id(), base, true).with_summary(
                    t.size(),
                    t.value_bytes(),
                    t.smallest().clone(),
                    t.biggest().clone(),
                )
            })
            .collect::<Vec<_>>();
        core.manifest.log_changes(&changes).map_err(Error::Manifest)?;
        core.ingest_of(base).add_tables(&tables);
        tracing::debug!(target: "levels", level = base, tables = tables.len(), "ingested tables");
        core.trigger();
        Ok(())
    }

    /// Returns the newest version of the user key of `key` whose version is at
    /// most the version of `key`.
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.core
            .levels
            .iter()
            .filter_map(|l| l.get(key))
            .max_by_key(|v| v.version)
    }

    /// Returns false if a live table references the value log file `fid`.
    pub fn can_remove_segment(&self, fid: u32) -> bool {
        self.core.levels.iter().all(|l| {
            let main = l.snapshot();
            let ingest = l.ingest().map(IngestBuffer::snapshot);
            let unreferenced = main
                .tables()
                .iter()
                .chain(ingest.iter().flat_map(|s| s.tables()))
                .all(|t| !t.vlog_refs().contains_key(&fid));
            unreferenced
        })
    }

    /// Sets the highest version compactions may drop older versions below.
    #[inline]
    pub fn set_discard_ts(&self, ts: u64) {
        self.core.discard_ts.store(ts, Ordering::Release)
    }

    #[inline]
    pub fn discard_ts(&self) -> u64 {
        self.core.discard_ts()
    }

    #[inline]
    pub fn pick_compact_levels(&self) -> Vec<CompactionPriority> {
        self.core.pick_compact_levels()
    }

    #[inline]
    pub fn level_targets(&self) -> Targets {
        self.core.level_targets()
    }

    #[inline]
    pub fn trigger_compaction(&self) {
        self.core.trigger()
    }

    #[inline]
    pub fn compact_status(&self) -> &CompactStatus {
        &self.core.cstatus
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.core.levels.len()
    }

    #[inline]
    pub fn level(&self, level: usize) -> &LevelHandler {
        &self.core.levels[level]
    }

    #[inline]
    pub fn table_count(&self, level: usize) -> usize {
        self.core.levels[level].num_tables()
    }

    #[inline]
    pub fn ingest_table_count(&self, level: usize) -> usize {
        self.core.levels[level]
            .ingest()
            .map_or(0, IngestBuffer::table_count)
    }

    /// Returns the main tables of a level.
    #[inline]
    pub fn tables(&self, level: usize) -> Vec<Table> {
        self.core.levels[level].snapshot().tables().to_vec()
    }

    /// Returns true while writes should be slowed down.
    #[inline]
    pub fn is_write_throttled(&self) -> bool {
        self.core.write_throttled()
    }

    /// Plans and runs one compaction for `prio` on behalf of `worker`.
    #[inline]
    pub fn do_compact(&self, worker: usize, prio: CompactionPriority) -> Result<()> {
        self.core.do_compact(worker, prio)
    }

    /// Runs one round of the compaction worker `worker`. Returns true if a
    /// compaction ran.
    #[inline]
    pub fn compact_once(&self, worker: usize) -> bool {
        self.core.run_once(worker)
    }

    /// Spawns `num_compactors` worker threads. They stop once `closer` is
    /// signaled, [`Closer::signal_and_wait`] waits for them.
    pub fn start_compaction(&self, closer: &Closer) -> Result<()> {
        for id in 0..self.core.opts.num_compactors() {
            closer.add_running(1);
            let core = self.core.clone();
            let c = closer.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("vela-compactor-{id}"))
                .spawn(move || core.run_compactor(id, c));
            if let Err(e) = spawned {
                closer.done();
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Checks the structural invariants of every level. Panics on a violation.
    pub fn validate(&self) {
        for l in &self.core.levels {
            let main = l.snapshot();
            let tables = main.tables();
            if l.level() > 0 {
                assert!(is_sorted_disjoint(tables), "level {} tables overlap", l.level());
            }
            for t in tables {
                assert!(
                    t.smallest() <= t.biggest(),
                    "table {} has its smallest key after its biggest",
                    t.id()
                );
            }
            assert_eq!(
                main.total_size(),
                tables.iter().map(Table::size).sum::<u64>(),
                "level {} size accounting is off",
                l.level()
            );
            if let Some(ingest) = l.ingest() {
                let snapshot = ingest.snapshot();
                assert_eq!(
                    snapshot.total_size(),
                    snapshot.tables().map(Table::size).sum::<u64>(),
                    "ingest buffer of level {} size accounting is off",
                    l.level()
                );
            }
        }
    }
}

/// Removes the table files of the directory the manifest does not list.
/// Returns the biggest table id seen.
fn remove_orphans(
    opts: &LevelsOptions,
    listed: &HashMap<u64, vela_traits::TableManifest>,
) -> Result<u64> {
    let mut max_id = listed.keys().copied().max().unwrap_or(0);
    let mut removed = HashSet::new();
    for entry in std::fs::read_dir(opts.dir())? {
        let path = entry?.path();
        let Some(id) = parse_file_id(&path) else {
            continue;
        };
        max_id = max_id.max(id);
        if listed.contains_key(&id) {
            continue;
        }
        std::fs::remove_file(&path)?;
        removed.insert(id);
    }
    if !removed.is_empty() {
        tracing::info!(target: "levels", tables = ?removed, "removed table files missing from the manifest");
    }
    Ok(max_id)
}

#[cfg(test)]
pub(crate) mod test;

use super::*;
use crate::{metrics::Metrics, vlog::discard_channel, MemoryManifest};
use bable::Flag;
use kvstructs::{Key, ValuePointer};
use std::{
    path::Path,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

pub(crate) fn key(user_key: impl AsRef<[u8]>, ts: u64) -> Key {
    Key::from_with_timestamp(user_key, ts)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

pub(crate) fn test_options(dir: &Path) -> LevelsOptions {
    LevelsOptions::new()
        .set_dir(dir)
        .set_max_levels(4)
        .set_num_compactors(2)
        .set_num_level_zero_tables(2)
        .set_num_level_zero_tables_stall(8)
        .set_base_table_size(64 << 10)
        .set_base_level_size(256 << 10)
        .set_mem_table_size(64 << 10)
        .set_ingest_backlog_trigger(2)
        .set_compaction_interval(Duration::from_millis(20))
}

/// Returns a builder holding `entries`, in any order.
pub(crate) fn builder(mut entries: Vec<(Key, Value)>) -> Builder {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut b = Builder::new(TableOptions::new().set_table_size(64 << 20));
    for (k, v) in &entries {
        b.insert(k, v);
    }
    b
}

pub(crate) fn open(dir: &Path) -> (LevelsController, Arc<MemoryManifest>) {
    open_with(test_options(dir))
}

pub(crate) fn open_with(opts: LevelsOptions) -> (LevelsController, Arc<MemoryManifest>) {
    let manifest = Arc::new(MemoryManifest::new());
    let lc = LevelsController::open(opts, Collaborators::new(manifest.clone())).unwrap();
    (lc, manifest)
}

/// Writes a table holding `entries` and adds it to level 0.
pub(crate) fn add_l0(lc: &LevelsController, entries: Vec<(Key, Value)>) -> Table {
    let t = lc.create_table(builder(entries)).unwrap();
    lc.add_l0_table(t.clone()).unwrap();
    t
}

/// Writes a table with a key per user key of `keys`, all at version `ts`.
pub(crate) fn add_l0_keys(lc: &LevelsController, keys: &[&str], ts: u64) -> Table {
    let entries = keys
        .iter()
        .map(|k| (key(k, ts), Value::new(format!("{k}@{ts}"))))
        .collect();
    add_l0(lc, entries)
}

/// Places tables directly at their levels by writing them to the manifest
/// before opening the controller.
pub(crate) fn open_with_layout(
    opts: LevelsOptions,
    layout: Vec<(usize, bool, Builder)>,
) -> (LevelsController, Arc<MemoryManifest>) {
    std::fs::create_dir_all(opts.dir()).unwrap();
    let manifest = Arc::new(MemoryManifest::new());
    for (i, (level, ingest, b)) in layout.into_iter().enumerate() {
        let id = i as u64 + 1;
        Table::create(table_path(opts.dir(), id), id, b, None).unwrap();
        manifest
            .log_changes(&[ManifestChange::create(id, level, ingest)])
            .unwrap();
    }
    let lc = LevelsController::open(opts, Collaborators::new(manifest.clone())).unwrap();
    (lc, manifest)
}

/// Compacts until no worker finds anything to do.
pub(crate) fn compact_all(lc: &LevelsController) {
    for _ in 0..1000 {
        if !lc.compact_once(0) {
            return;
        }
        lc.validate();
    }
    panic!("compactions never settle");
}

pub(crate) fn sst_files(dir: &Path) -> Vec<u64> {
    let mut ids = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| parse_file_id(e.unwrap().path()))
        .collect::<Vec<_>>();
    ids.sort_unstable();
    ids
}

impl LevelsController {
    pub(crate) fn core(&self) -> &Core {
        &self.core
    }
}

#[test]
fn test_open_empty() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    assert_eq!(lc.num_levels(), 4);
    for l in 0..4 {
        assert_eq!(lc.table_count(l), 0);
        assert_eq!(lc.ingest_table_count(l), 0);
    }
    assert!(lc.level(0).ingest().is_none());
    assert!(lc.level(1).ingest().is_some());
    assert_eq!(lc.discard_ts(), u64::MAX);
    assert_eq!(lc.new_table_id(), 1);
    assert!(lc.pick_compact_levels().is_empty());
    assert!(format!("{lc:?}").starts_with("LevelsController"));
}

#[test]
fn test_open_invalid_options() {
    let dir = tempfile::tempdir().unwrap();
    let opts = test_options(dir.path()).set_ingest_shards(3);
    let manifest = Arc::new(MemoryManifest::new());
    let err = LevelsController::open(opts, Collaborators::new(manifest)).unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
}

#[test]
fn test_open_missing_table() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Arc::new(MemoryManifest::new());
    manifest
        .log_changes(&[ManifestChange::create(7, 1, false)])
        .unwrap();
    let err = LevelsController::open(test_options(dir.path()), Collaborators::new(manifest))
        .unwrap_err();
    assert!(matches!(err, Error::TableNotFound(7)));
}

#[test]
fn test_get_newest_version() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    add_l0_keys(&lc, &["a", "b"], 1);
    add_l0_keys(&lc, &["b", "c"], 2);

    assert_eq!(lc.get(&key("b", u64::MAX)).unwrap().value, "b@2");
    assert_eq!(lc.get(&key("b", 1)).unwrap().value, "b@1");
    assert_eq!(lc.get(&key("a", u64::MAX)).unwrap().version, 1);
    assert!(lc.get(&key("b", 0)).is_none());
    assert!(lc.get(&key("d", u64::MAX)).is_none());
}

#[test]
fn test_reload_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, manifest) = open(dir.path());
    add_l0_keys(&lc, &["a", "b", "c"], 1);
    add_l0_keys(&lc, &["b", "c", "d"], 2);
    compact_all(&lc);
    add_l0_keys(&lc, &["x"], 3);

    let base = lc.level_targets().base_level;
    let ingested = lc
        .create_table(builder(vec![(key("m", 4), Value::new("m@4"))]))
        .unwrap();
    lc.ingest_tables(vec![ingested.clone()]).unwrap();

    let layout = (0..lc.num_levels())
        .map(|l| {
            let ids = lc.tables(l).iter().map(Table::id).collect::<Vec<_>>();
            (ids, lc.ingest_table_count(l))
        })
        .collect::<Vec<_>>();
    drop(ingested);
    drop(lc);

    // a table file nobody knows about
    let orphan_id = 999;
    Table::create(
        table_path(dir.path(), orphan_id),
        orphan_id,
        builder(vec![(key("z", 1), Value::new("z"))]),
        None,
    )
    .unwrap();

    let lc = LevelsController::open(test_options(dir.path()), Collaborators::new(manifest)).unwrap();
    for (l, (ids, ingest)) in layout.into_iter().enumerate() {
        assert_eq!(lc.tables(l).iter().map(Table::id).collect::<Vec<_>>(), ids);
        assert_eq!(lc.ingest_table_count(l), ingest);
    }
    assert_eq!(lc.ingest_table_count(base), 1);
    assert!(!table_path(dir.path(), orphan_id).exists());
    assert!(lc.new_table_id() > orphan_id);
    assert_eq!(lc.get(&key("m", u64::MAX)).unwrap().value, "m@4");
    assert_eq!(lc.get(&key("c", u64::MAX)).unwrap().value, "c@2");
    lc.validate();
}

#[test]
fn test_obsolete_table_outlives_its_readers() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    let t1 = add_l0_keys(&lc, &["a", "b"], 1);
    add_l0_keys(&lc, &["b", "c"], 2);

    let path = t1.path().to_path_buf();
    let it = t1.iter(Flag::NONE);
    drop(t1);

    assert!(lc.compact_once(0));
    assert_eq!(lc.table_count(0), 0);
    assert!(path.exists());
    drop(it);
    assert!(!path.exists());
}

#[test]
fn test_can_remove_segment() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    add_l0(
        &lc,
        vec![(key("a", 1), Value::pointer(ValuePointer::new(7, 100, 0)))],
    );
    assert!(!lc.can_remove_segment(7));
    assert!(lc.can_remove_segment(8));

    add_l0(
        &lc,
        vec![(key("a", 2), Value::pointer(ValuePointer::new(8, 50, 0)))],
    );
    assert!(lc.compact_once(0));
    // the old version of "a" is gone, and with it the last reference to file 7
    assert!(lc.can_remove_segment(7));
    assert!(!lc.can_remove_segment(8));

    // ingest buffers hold references too
    let t = lc
        .create_table(builder(vec![(key("b", 3), Value::pointer(ValuePointer::new(9, 10, 0)))]))
        .unwrap();
    lc.ingest_tables(vec![t]).unwrap();
    assert!(!lc.can_remove_segment(9));
}

#[test]
fn test_discard_stats_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Arc::new(MemoryManifest::new());
    let opts = test_options(dir.path());
    let (tx, rx) = discard_channel(&opts);
    let lc = LevelsController::open(
        opts,
        Collaborators::new(manifest).with_discard_sender(tx),
    )
    .unwrap();

    add_l0(
        &lc,
        vec![
            (key("a", 1), Value::pointer(ValuePointer::new(7, 100, 0))),
            (key("b", 1), Value::pointer(ValuePointer::new(7, 20, 100))),
        ],
    );
    add_l0(
        &lc,
        vec![(key("a", 2), Value::pointer(ValuePointer::new(8, 30, 0)))],
    );
    assert!(lc.compact_once(0));

    let stats = rx.try_recv().unwrap();
    assert_eq!(stats.get(&7), Some(&100));
    assert!(!stats.contains_key(&8));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_discard_stats_channel_full() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Arc::new(MemoryManifest::new());
    let metrics = Arc::new(Metrics::new());
    let opts = test_options(dir.path()).set_discard_channel_capacity(1);
    let (tx, _rx) = discard_channel(&opts);
    assert_eq!(tx.capacity(), Some(1));
    let lc = LevelsController::open(
        opts,
        Collaborators::new(manifest)
            .with_discard_sender(tx)
            .with_metrics(metrics.clone()),
    )
    .unwrap();

    for round in 0..2u64 {
        let ts = round * 2;
        add_l0(&lc, vec![(key("a", ts + 1), Value::pointer(ValuePointer::new(1, 10, 0)))]);
        add_l0(&lc, vec![(key("a", ts + 2), Value::pointer(ValuePointer::new(2, 10, 0)))]);
        assert!(lc.compact_once(0));
    }
    assert_eq!(metrics.discard_stats_dropped(), 1);
    assert_eq!(metrics.compactions(), 2);
}

#[test]
fn test_discard_ts_keeps_readable_versions() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    lc.set_discard_ts(1);
    add_l0_keys(&lc, &["a"], 1);
    add_l0_keys(&lc, &["a"], 2);
    add_l0_keys(&lc, &["a"], 3);
    compact_all(&lc);

    // versions above the discard timestamp survive
    assert_eq!(lc.get(&key("a", 3)).unwrap().value, "a@3");
    assert_eq!(lc.get(&key("a", 2)).unwrap().value, "a@2");
    assert_eq!(lc.get(&key("a", 1)).unwrap().value, "a@1");
}

#[test]
fn test_write_throttle() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Arc::new(MemoryManifest::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let ev = events.clone();
    let lc = LevelsController::open(
        test_options(dir.path()),
        Collaborators::new(manifest)
            .with_write_throttle(Arc::new(move |on: bool| ev.lock().unwrap().push(on))),
    )
    .unwrap();

    for i in 0..5 {
        add_l0_keys(&lc, &["a", "b"], i + 1);
    }
    lc.core().check_write_throttle();
    lc.core().check_write_throttle();
    assert!(lc.is_write_throttled());

    compact_all(&lc);
    lc.core().check_write_throttle();
    assert!(!lc.is_write_throttled());
    assert_eq!(*events.lock().unwrap(), vec![true, false]);
}

#[test]
fn test_l0_stall_released_by_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let opts = test_options(dir.path()).set_num_level_zero_tables_stall(5);
    let metrics = Arc::new(Metrics::new());
    let manifest = Arc::new(MemoryManifest::new());
    let lc = LevelsController::open(
        opts,
        Collaborators::new(manifest).with_metrics(metrics.clone()),
    )
    .unwrap();
    for i in 0..5 {
        add_l0_keys(&lc, &["a"], i + 1);
    }

    let closer = Closer::default();
    lc.start_compaction(&closer).unwrap();
    add_l0_keys(&lc, &["a"], 6);
    closer.signal_and_wait();

    assert_eq!(metrics.l0_stalls(), 1);
    assert_eq!(lc.get(&key("a", u64::MAX)).unwrap().value, "a@6");
    lc.validate();
}

#[test]
fn test_background_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    let closer = Closer::default();
    lc.start_compaction(&closer).unwrap();

    for i in 0..6u64 {
        let keys = (0..50).map(|k| format!("key{:04}", k * 6 + i)).collect::<Vec<_>>();
        let keys = keys.iter().map(String::as_str).collect::<Vec<_>>();
        add_l0_keys(&lc, &keys, i + 1);
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    while lc.table_count(0) >= 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    closer.signal_and_wait();

    assert!(lc.table_count(0) < 2);
    lc.validate();
    for k in 0..300u64 {
        let v = lc.get(&key(format!("key{k:04}"), u64::MAX)).unwrap();
        assert_eq!(v.version, k % 6 + 1);
    }
}

#[test]
fn test_reads_through_block_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(bable::cache::LruCache::new(64, 16));
    let lc = LevelsController::open(
        test_options(dir.path()),
        Collaborators::new(Arc::new(MemoryManifest::new())).with_cache(cache.clone()),
    )
    .unwrap();
    add_l0_keys(&lc, &["a", "b"], 1);
    add_l0_keys(&lc, &["b", "c"], 2);
    assert_eq!(lc.get(&key("b", u64::MAX)).unwrap().value, "b@2");
    assert!(cache.block_count() > 0);

    assert!(lc.compact_once(0));
    assert_eq!(lc.get(&key("a", u64::MAX)).unwrap().value, "a@1");
    assert_eq!(lc.get(&key("b", u64::MAX)).unwrap().value, "b@2");
}

use super::*;
use crate::{
    error::Error,
    levels::test::*,
    metrics::Metrics,
    Collaborators, LevelsController, MemoryManifest,
};
use bable::{table_path, Builder};
use kvstructs::{Key, Value};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::BTreeMap,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use vela_options::LevelsOptions;
use vela_traits::{Manifest, ManifestChange, TableManifest};

fn reservation(level: usize, left: &str, right: &str) -> CompactDef {
    let prio = CompactionPriority::new(level, 1.0, IngestMode::None, Targets::default());
    let mut cd = CompactDef::new(0, prio);
    cd.next_level = level + 1;
    cd.this_range = KeyRange::new(key(left, u64::MAX), key(right, 0));
    cd.next_range = cd.this_range.clone();
    cd
}

fn aged_builder(entries: Vec<(Key, Value)>, age: Duration) -> Builder {
    let mut b = builder(entries);
    b.set_created_at(now_millis() - age.as_millis() as u64);
    b
}

struct FailingManifest {
    inner: MemoryManifest,
    fail: AtomicBool,
}

impl Manifest for FailingManifest {
    fn log_changes(&self, changes: &[ManifestChange]) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "manifest is read only"));
        }
        self.inner.log_changes(changes)
    }

    fn tables(&self) -> std::collections::HashMap<u64, TableManifest> {
        self.inner.tables()
    }
}

#[test]
fn test_l0_score() {
    let opts = LevelsOptions::new()
        .set_num_level_zero_tables(16)
        .set_num_level_zero_tables_stall(32);
    let mut levels = vec![LevelStatus::default(); opts.max_levels()];
    levels[0].num_tables = 20;

    let prios = pick_compact_levels(&opts, &levels);
    assert_eq!(prios.len(), 1);
    assert_eq!(prios[0].level, 0);
    assert_eq!(prios[0].score, 1.25);
    assert_eq!(prios[0].ingest_mode, IngestMode::None);
}

#[test]
fn test_level_scores() {
    let opts = LevelsOptions::new();
    let mut levels = vec![LevelStatus::default(); 7];
    levels[5].total_size = 150 << 20;
    levels[6].total_size = 1000 << 20;

    let targets = Targets::compute(&opts, &levels.iter().map(|l| l.total_size).collect::<Vec<_>>());
    assert_eq!(targets.base_level, 4);
    assert_eq!(targets.target_size[6], 1000 << 20);
    assert_eq!(targets.target_size[5], 100 << 20);
    assert_eq!(targets.file_size[0], opts.mem_table_size());
    assert_eq!(targets.file_size[4], opts.base_table_size());
    assert_eq!(targets.file_size[5], opts.base_table_size() * 2);

    let prios = pick_compact_levels(&opts, &levels);
    assert_eq!(prios.iter().map(|p| p.level).collect::<Vec<_>>(), vec![5, 6]);
    assert_eq!(prios[0].score, 1.5);
    assert_eq!(prios[0].adjusted, 1.5);
    assert_eq!(prios[1].score, 1.0);

    // bytes being compacted away do not count
    levels[5].del_size = 60 << 20;
    let prios = pick_compact_levels(&opts, &levels);
    assert_eq!(prios.iter().map(|p| p.level).collect::<Vec<_>>(), vec![6]);
}

#[test]
fn test_targets_of_empty_tree() {
    let opts = LevelsOptions::new();
    let targets = Targets::compute(&opts, &[0; 7]);
    assert_eq!(targets.base_level, 6);
    assert!(targets.target_size[1..]
        .iter()
        .all(|t| *t == opts.base_level_size()));
}

#[test]
fn test_ingest_priorities() {
    let opts = LevelsOptions::new();
    let mut levels = vec![LevelStatus::default(); 7];

    // below the backlog trigger and young
    levels[2].ingest_tables = 1;
    levels[2].ingest_size = 1 << 20;
    assert!(pick_compact_levels(&opts, &levels).is_empty());

    // a big backlog drains and compacts in place
    levels[2].ingest_tables = 4;
    levels[2].ingest_size = 10 * opts.base_table_size();
    let prios = pick_compact_levels(&opts, &levels);
    assert_eq!(prios.len(), 2);
    assert_eq!((prios[0].ingest_mode, prios[0].score), (IngestMode::Drain, 10.0));
    assert_eq!((prios[1].ingest_mode, prios[1].adjusted), (IngestMode::Keep, 8.0));

    // an old buffer is drained regardless of its size
    levels[2].ingest_tables = 1;
    levels[2].ingest_size = 1024;
    levels[2].ingest_age = Duration::from_secs(200);
    let prios = pick_compact_levels(&opts, &levels);
    assert_eq!(prios.len(), 2);
    assert_eq!(prios[0].ingest_mode, IngestMode::Drain);
    assert_eq!(prios[0].score, 3.5);
    assert_eq!(prios[1].ingest_mode, IngestMode::Keep);
}

#[test]
fn test_ingest_age_factor() {
    assert_eq!(ingest_age_factor(Duration::ZERO), 1.0);
    assert_eq!(ingest_age_factor(Duration::from_secs(80)), 2.0);
    assert_eq!(ingest_age_factor(Duration::from_secs(240)), 4.0);
    assert_eq!(ingest_age_factor(Duration::from_secs(3600)), 4.0);
}

#[test]
fn test_scoring_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(7);
    let opts = LevelsOptions::new().set_value_weight(0.5);
    for _ in 0..50 {
        let levels = (0..7)
            .map(|_| LevelStatus {
                num_tables: rng.gen_range(0..20),
                total_size: rng.gen_range(0..1u64 << 32),
                value_bytes: rng.gen_range(0..1u64 << 30),
                ingest_tables: rng.gen_range(0..8),
                ingest_size: rng.gen_range(0..1u64 << 26),
                ingest_age: Duration::from_secs(rng.gen_range(0..300)),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        let first = pick_compact_levels(&opts, &levels);
        assert_eq!(first, pick_compact_levels(&opts, &levels));
        assert!(first.iter().all(|p| p.score >= 1.0));
        assert!(first.windows(2).all(|w| w[0].adjusted >= w[1].adjusted));
    }

    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    add_l0_keys(&lc, &["a"], 1);
    add_l0_keys(&lc, &["a"], 2);
    assert_eq!(lc.pick_compact_levels(), lc.pick_compact_levels());
}

#[test]
fn test_compare_and_add() {
    let cs = CompactStatus::new(7);
    let am = reservation(3, "a", "m");
    let nz = reservation(3, "n", "z");
    let gt = reservation(3, "g", "t");

    assert!(cs.compare_and_add(&am));
    assert!(cs.compare_and_add(&nz));
    assert!(!cs.compare_and_add(&gt));
    assert_eq!(cs.num_reservations(3), 2);
    assert_eq!(cs.num_reservations(4), 2);

    cs.remove(&am);
    assert!(!cs.compare_and_add(&gt));
    cs.remove(&nz);
    assert!(cs.compare_and_add(&gt));
    cs.remove(&gt);
    assert_eq!(cs.num_reservations(3), 0);
    assert_eq!(cs.num_reservations(4), 0);
}

#[test]
fn test_compare_and_add_infinite() {
    let cs = CompactStatus::new(2);
    let mut inf = reservation(0, "a", "a");
    inf.next_level = 0;
    inf.this_range = KeyRange::inf();
    inf.next_range = KeyRange::default();
    let other = reservation(0, "c", "d");

    assert!(cs.compare_and_add(&other));
    // only another infinite reservation stands in the way
    assert!(cs.compare_and_add(&inf));
    assert!(!cs.compare_and_add(&inf));
    assert!(!cs.compare_and_add(&reservation(0, "x", "y")));

    cs.remove(&inf);
    cs.remove(&other);
    assert_eq!(cs.num_reservations(0), 0);
}

#[test]
fn test_compare_and_add_concurrent() {
    let cs = CompactStatus::new(7);
    let name = |i: u32| format!("k{i:03}");
    let overlaps = |a: (u32, u32), b: (u32, u32)| a.0 <= b.1 && b.0 <= a.1;
    let random_range = |rng: &mut StdRng| {
        let l = rng.gen_range(0..200);
        (l, l + rng.gen_range(0..20))
    };

    // reservations come and go while every holder checks it is alone
    let held = parking_lot::Mutex::new(Vec::<(u32, u32)>::new());
    let accepted = std::sync::atomic::AtomicUsize::new(0);
    std::thread::scope(|s| {
        for seed in 0..8 {
            let (cs, held, accepted) = (&cs, &held, &accepted);
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..500 {
                    let r = random_range(&mut rng);
                    let cd = reservation(3, &name(r.0), &name(r.1));
                    if !cs.compare_and_add(&cd) {
                        continue;
                    }
                    accepted.fetch_add(1, Ordering::Relaxed);
                    {
                        let mut held = held.lock();
                        assert!(held.iter().all(|h| !overlaps(*h, r)), "{r:?} overlaps {held:?}");
                        held.push(r);
                    }
                    std::thread::yield_now();
                    held.lock().retain(|h| *h != r);
                    cs.remove(&cd);
                }
            });
        }
    });
    assert!(accepted.load(Ordering::Relaxed) > 0);
    assert_eq!(cs.num_reservations(3), 0);
    assert_eq!(cs.num_reservations(4), 0);

    // without releases, the winners of a race are pairwise disjoint and losers add nothing
    let winners = parking_lot::Mutex::new(Vec::new());
    std::thread::scope(|s| {
        for seed in 100..108 {
            let (cs, winners) = (&cs, &winners);
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..50 {
                    let r = random_range(&mut rng);
                    if cs.compare_and_add(&reservation(3, &name(r.0), &name(r.1))) {
                        winners.lock().push(r);
                    }
                }
            });
        }
    });
    let winners = winners.into_inner();
    assert!(!winners.is_empty());
    for (i, a) in winners.iter().enumerate() {
        assert!(winners[i + 1..].iter().all(|b| !overlaps(*a, *b)), "{a:?} overlaps");
    }
    assert_eq!(cs.num_reservations(3), winners.len());
    assert_eq!(cs.num_reservations(4), winners.len());
}

#[test]
#[should_panic]
fn test_remove_unknown_reservation() {
    let cs = CompactStatus::new(7);
    cs.remove(&reservation(2, "a", "b"));
}

#[test]
fn test_max_level_picks_stale_table() {
    let dir = tempfile::tempdir().unwrap();
    let value = vec![7u8; 1 << 20];
    let mut stale = builder(Vec::new());
    for i in 0..13 {
        stale.insert_stale(&key(format!("a{i:02}"), 1), &Value::new(value.clone()));
    }
    stale.set_created_at(now_millis() - 2 * 3600 * 1000);
    let sibling = {
        let mut b = builder(Vec::new());
        b.insert_stale(&key("z", 1), &Value::new("z"));
        b.set_created_at(now_millis() - 2 * 3600 * 1000);
        b
    };

    let (lc, _) = open_with_layout(
        test_options(dir.path()),
        vec![(3, false, stale), (3, false, sibling)],
    );
    assert!(lc.tables(3)[0].stale_data_size() > 12 << 20);
    assert!(lc.tables(3)[1].stale_data_size() < 1 << 10);

    let prio = CompactionPriority::new(3, 1.0, IngestMode::None, lc.level_targets());
    lc.do_compact(0, prio).unwrap();

    let ids = lc.tables(3).iter().map(Table::id).collect::<Vec<_>>();
    assert!(!ids.contains(&1));
    assert!(ids.contains(&2));
    assert!(lc.tables(3).iter().all(|t| t.id() == 2 || t.stale_data_size() == 0));
    lc.validate();
    for i in 0..13 {
        assert_eq!(lc.get(&key(format!("a{i:02}"), u64::MAX)).unwrap().value.len(), 1 << 20);
    }
}

#[test]
fn test_max_level_skips_young_tables() {
    let dir = tempfile::tempdir().unwrap();
    let mut stale = builder(Vec::new());
    let value = vec![7u8; 1 << 20];
    for i in 0..11 {
        stale.insert_stale(&key(format!("a{i:02}"), 1), &Value::new(value.clone()));
    }
    let (lc, _) = open_with_layout(test_options(dir.path()), vec![(3, false, stale)]);

    let prio = CompactionPriority::new(3, 1.0, IngestMode::None, lc.level_targets());
    assert!(matches!(lc.do_compact(0, prio), Err(Error::FillTables)));
    assert_eq!(lc.compact_status().num_reservations(3), 0);
}

#[test]
fn test_l0_to_l0() {
    let dir = tempfile::tempdir().unwrap();
    let layout = |n: usize| {
        (0..n)
            .map(|i| {
                let entries = vec![(key("k", i as u64 + 1), Value::new(format!("v{i}")))];
                let age = Duration::from_secs(60 + (n - i) as u64);
                (0, false, aged_builder(entries, age))
            })
            .collect::<Vec<_>>()
    };
    let low = |lc: &LevelsController| {
        CompactionPriority::new(0, 0.5, IngestMode::None, lc.level_targets())
    };

    // three tables are not worth it
    let (lc, _) = open_with_layout(test_options(&dir.path().join("3")), layout(3));
    assert!(matches!(lc.do_compact(0, low(&lc)), Err(Error::FillTables)));
    assert_eq!(lc.table_count(0), 3);

    let (lc, _) = open_with_layout(test_options(&dir.path().join("4")), layout(4));
    let oldest = lc.tables(0).iter().map(Table::created_at).min().unwrap();
    // only worker 0 compacts level 0 into itself
    assert!(matches!(lc.do_compact(1, low(&lc)), Err(Error::FillTables)));
    lc.do_compact(0, low(&lc)).unwrap();

    let tables = lc.tables(0);
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].created_at(), oldest);
    assert_eq!(tables[0].key_count(), 1);
    assert_eq!(lc.get(&key("k", u64::MAX)).unwrap().value, "v3");
    assert_eq!(lc.compact_status().num_reservations(0), 0);
}

#[test]
fn test_l0_busy_oldest_table_yields_no_plan() {
    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(Metrics::new());
    let lc = LevelsController::open(
        test_options(dir.path()),
        Collaborators::new(Arc::new(MemoryManifest::new())).with_metrics(metrics.clone()),
    )
    .unwrap();
    for ts in 1..=3 {
        add_l0_keys(&lc, &["a", "b"], ts);
    }

    // another worker holds the oldest table
    let base = lc.level_targets().base_level;
    let prio = CompactionPriority::new(0, 1.5, IngestMode::None, lc.level_targets());
    let mut running = CompactDef::new(0, prio.clone());
    running.next_level = base;
    running.top = vec![lc.tables(0)[0].clone()];
    running.this_range = key_range_of(&running.top);
    running.next_range = running.this_range.clone();
    assert!(lc.compact_status().compare_and_add(&running));

    assert!(matches!(lc.do_compact(1, prio), Err(Error::FillTables)));
    assert_eq!(metrics.compactions(), 0);
    assert_eq!(lc.table_count(0), 3);
    assert_eq!(lc.compact_status().num_reservations(0), 1);

    lc.compact_status().remove(&running);
    assert!(lc.compact_once(1));
    assert_eq!(metrics.compactions(), 1);
}

#[test]
fn test_l0_fast_path_to_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    add_l0_keys(&lc, &["a", "c", "e"], 1);
    add_l0_keys(&lc, &["b", "d", "f"], 2);
    assert!(lc.compact_once(0));
    let base = lc.level_targets().base_level;
    let main = lc.tables(base).iter().map(Table::id).collect::<Vec<_>>();
    assert!(!main.is_empty());

    for ts in 3..7 {
        add_l0_keys(&lc, &["b", "c", "d"], ts);
    }
    let prio = lc.pick_compact_levels().remove(0);
    assert_eq!(prio.level, 0);
    lc.do_compact(0, prio).unwrap();

    assert_eq!(lc.table_count(0), 0);
    assert_eq!(lc.tables(base).iter().map(Table::id).collect::<Vec<_>>(), main);
    assert_eq!(lc.ingest_table_count(base), 1);
    assert_eq!(lc.get(&key("c", u64::MAX)).unwrap().value, "c@6");
    assert_eq!(lc.get(&key("e", u64::MAX)).unwrap().value, "e@1");
}

#[test]
fn test_regular_picks_oldest_data() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open_with_layout(
        test_options(dir.path()),
        vec![
            (1, false, builder(vec![(key("a", 5), Value::new("a@5"))])),
            (1, false, builder(vec![(key("b", 2), Value::new("b@2"))])),
            (2, false, builder(vec![(key("b", 1), Value::new("b@1"))])),
        ],
    );
    let prio = CompactionPriority::new(1, 1.5, IngestMode::None, lc.level_targets());
    lc.do_compact(0, prio).unwrap();

    assert_eq!(lc.tables(1).iter().map(Table::id).collect::<Vec<_>>(), vec![1]);
    let next = lc.tables(2);
    assert_eq!(next.len(), 1);
    assert!(next[0].id() > 3);
    assert_eq!(next[0].key_count(), 1);
    assert_eq!(lc.get(&key("b", u64::MAX)).unwrap().value, "b@2");
    lc.validate();
}

#[test]
fn test_add_splits() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    let prio = CompactionPriority::new(1, 1.0, IngestMode::None, lc.level_targets());
    let mut cd = CompactDef::new(0, prio);
    cd.next_level = 2;
    cd.bot = (0..10)
        .map(|i| {
            lc.create_table(builder(vec![(key(format!("k{i:02}"), 1), Value::new("v"))]))
                .unwrap()
        })
        .collect();

    lc.core().add_splits(&mut cd);
    assert_eq!(cd.splits.len(), 4);
    assert!(cd.splits[0].start().is_empty());
    assert_eq!(cd.splits[0].end(), &key("k02", 0));
    assert_eq!(cd.splits[1].start(), &key("k02", 0));
    assert_eq!(cd.splits[1].end(), &key("k05", 0));
    assert_eq!(cd.splits[2].end(), &key("k08", 0));
    assert!(cd.splits[3].end().is_empty());

    cd.bot.truncate(2);
    lc.core().add_splits(&mut cd);
    assert_eq!(cd.splits.len(), 1);
}

#[test]
fn test_split_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let name = |i: usize| format!("k{i:03}");
    let mut layout = (0..12)
        .map(|t| {
            let entries = (t * 10..t * 10 + 10)
                .map(|i| (key(name(i), 1), Value::new(format!("old{i}"))))
                .collect();
            (2, false, builder(entries))
        })
        .collect::<Vec<_>>();
    let top = (0..120)
        .filter(|i| i % 7 == 0)
        .map(|i| {
            let v = if i % 2 == 0 {
                Value::tombstone()
            } else {
                Value::new(format!("new{i}"))
            };
            (key(name(i), 2), v)
        })
        .collect();
    layout.push((1, false, builder(top)));
    let (lc, _) = open_with_layout(test_options(dir.path()), layout);

    let prio = CompactionPriority::new(1, 2.0, IngestMode::None, lc.level_targets());
    lc.do_compact(0, prio).unwrap();
    assert_eq!(lc.table_count(1), 0);
    lc.validate();

    for i in 0..120 {
        let got = lc.get(&key(name(i), u64::MAX));
        match (i % 7, i % 2) {
            (0, 0) => assert!(got.is_none(), "{} should be deleted", name(i)),
            (0, _) => assert_eq!(got.unwrap().value, format!("new{i}")),
            _ => assert_eq!(got.unwrap().value, format!("old{i}")),
        }
    }
}

#[test]
fn test_ingest_keep_then_drain() {
    let dir = tempfile::tempdir().unwrap();
    let (lc, _) = open(dir.path());
    add_l0_keys(&lc, &["a1", "a5", "a9"], 1);
    add_l0_keys(&lc, &["a2", "a6"], 2);
    assert!(lc.compact_once(0));
    let base = lc.level_targets().base_level;

    let ingested = (0..3u64)
        .map(|i| {
            let entries = vec![
                (key(format!("a{}", i + 1), 10 + i), Value::new(format!("ingest{i}"))),
                (key(format!("a{}", i + 5), 10 + i), Value::new(format!("ingest{i}"))),
            ];
            lc.create_table(builder(entries)).unwrap()
        })
        .collect::<Vec<_>>();
    lc.ingest_tables(ingested).unwrap();
    assert_eq!(lc.ingest_table_count(base), 3);
    assert!(lc
        .pick_compact_levels()
        .iter()
        .any(|p| p.level == base && p.ingest_mode == IngestMode::Drain));

    let keep = CompactionPriority::new(base, 2.0, IngestMode::Keep, lc.level_targets());
    lc.do_compact(0, keep).unwrap();
    assert_eq!(lc.ingest_table_count(base), 1);
    assert_eq!(lc.get(&key("a6", u64::MAX)).unwrap().value, "ingest1");

    // a single table is not worth keeping
    let keep = CompactionPriority::new(base, 2.0, IngestMode::Keep, lc.level_targets());
    assert!(matches!(lc.do_compact(0, keep), Err(Error::FillTables)));

    let drain = CompactionPriority::new(base, 2.0, IngestMode::Drain, lc.level_targets());
    lc.do_compact(0, drain).unwrap();
    assert_eq!(lc.ingest_table_count(base), 0);
    lc.validate();

    let expect = [
        ("a1", "ingest0"),
        ("a2", "ingest1"),
        ("a3", "ingest2"),
        ("a5", "ingest0"),
        ("a6", "ingest1"),
        ("a7", "ingest2"),
        ("a9", "a9@1"),
    ];
    for (k, v) in expect {
        assert_eq!(lc.get(&key(k, u64::MAX)).unwrap().value, v);
    }
}

#[test]
fn test_manifest_failure_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Arc::new(FailingManifest {
        inner: MemoryManifest::new(),
        fail: AtomicBool::new(false),
    });
    let metrics = Arc::new(Metrics::new());
    let lc = LevelsController::open(
        test_options(dir.path()),
        Collaborators::new(manifest.clone()).with_metrics(metrics.clone()),
    )
    .unwrap();
    add_l0_keys(&lc, &["a", "b"], 1);
    add_l0_keys(&lc, &["b", "c"], 2);
    let files = sst_files(dir.path());

    manifest.fail.store(true, Ordering::SeqCst);
    let prio = lc.pick_compact_levels().remove(0);
    assert!(matches!(lc.do_compact(0, prio), Err(Error::Manifest(_))));

    assert_eq!(lc.table_count(0), 2);
    assert_eq!(sst_files(dir.path()), files);
    for l in 0..lc.num_levels() {
        assert_eq!(lc.compact_status().num_reservations(l), 0);
        assert_eq!(lc.compact_status().del_size(l), 0);
    }
    assert!(files.iter().all(|id| !lc.compact_status().is_compacting(*id)));
    assert_eq!(metrics.failed_compactions(), 1);

    manifest.fail.store(false, Ordering::SeqCst);
    assert!(lc.compact_once(0));
    assert_eq!(lc.table_count(0), 0);
    assert_eq!(lc.get(&key("b", u64::MAX)).unwrap().value, "b@2");
    assert_eq!(manifest.tables().len(), lc.tables(lc.level_targets().base_level).len());
}

#[test]
fn test_table_write_failure_discards_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let name = |i: usize| format!("k{i:03}");
    let mut layout = (0..12)
        .map(|t| {
            let entries = (t * 10..t * 10 + 10)
                .map(|i| (key(name(i), 1), Value::new(format!("old{i}"))))
                .collect();
            (2, false, builder(entries))
        })
        .collect::<Vec<_>>();
    let top = (0..120)
        .step_by(3)
        .map(|i| (key(name(i), 2), Value::new(format!("new{i}"))))
        .collect();
    layout.push((1, false, builder(top)));
    let (lc, manifest) = open_with_layout(test_options(dir.path()), layout);

    let before = (lc.tables(1), lc.tables(2));
    let listed = manifest.tables();
    // the second output of the plan collides with a foreign file
    let taken = lc.new_table_id() + 2;
    std::fs::write(table_path(dir.path(), taken), b"foreign").unwrap();
    let files = sst_files(dir.path());

    let prio = CompactionPriority::new(1, 2.0, IngestMode::None, lc.level_targets());
    assert!(matches!(lc.do_compact(0, prio), Err(Error::Table(_))));

    let ids = |ts: &[Table]| ts.iter().map(Table::id).collect::<Vec<_>>();
    assert_eq!(ids(&lc.tables(1)), ids(&before.0));
    assert_eq!(ids(&lc.tables(2)), ids(&before.1));
    assert_eq!(manifest.tables(), listed);
    assert_eq!(sst_files(dir.path()), files);
    assert_eq!(std::fs::read(table_path(dir.path(), taken)).unwrap(), b"foreign");
    for l in 0..lc.num_levels() {
        assert_eq!(lc.compact_status().num_reservations(l), 0);
        assert_eq!(lc.compact_status().del_size(l), 0);
    }
    assert_eq!(lc.get(&key(name(3), u64::MAX)).unwrap().value, "new3");
    lc.validate();
}

#[test]
fn test_random_compactions() {
    let dir = tempfile::tempdir().unwrap();
    let opts = test_options(dir.path())
        .set_base_table_size(4 << 10)
        .set_base_level_size(16 << 10)
        .set_mem_table_size(8 << 10)
        .set_block_size(1 << 10);
    let (lc, _) = open_with(opts);

    let mut rng = StdRng::seed_from_u64(42);
    let mut expected = BTreeMap::new();
    for ts in 1..=16u64 {
        let mut entries = BTreeMap::new();
        for _ in 0..300 {
            let k = format!("key{:05}", rng.gen_range(0..3000));
            let v = if rng.gen_ratio(1, 10) {
                None
            } else {
                Some(format!("{k}@{ts}-{}", rng.gen::<u32>()))
            };
            entries.insert(k, v);
        }
        let table = entries
            .iter()
            .map(|(k, v)| {
                let val = match v {
                    Some(v) => Value::new(v.clone()),
                    None => Value::tombstone(),
                };
                (key(k, ts), val)
            })
            .collect();
        add_l0(&lc, table);
        expected.extend(entries);
        compact_all(&lc);
    }

    assert!(lc.table_count(0) < 2);
    assert!((1..lc.num_levels()).any(|l| lc.table_count(l) > 1));
    for (k, v) in expected {
        let got = lc.get(&key(&k, u64::MAX));
        match v {
            Some(v) => assert_eq!(got.unwrap().value, v),
            None => assert!(got.map_or(true, |g| g.is_deleted()), "{k} should be deleted"),
        }
    }
}

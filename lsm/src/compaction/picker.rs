use std::time::Duration;

use vela_options::LevelsOptions;

use super::{CompactionPriority, IngestMode};

/// Ingest buffers older than this are drained regardless of their size.
pub(crate) const INGEST_MAX_AGE: Duration = Duration::from_secs(120);

/// Target sizes of the levels and the size of the tables written to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets {
    /// The level L0 compacts into.
    pub base_level: usize,
    pub target_size: Vec<u64>,
    pub file_size: Vec<u64>,
}

impl Targets {
    /// Computes the targets from the size of the main tables of each level.
    ///
    /// The last level is sized after the data it holds, every level above it
    /// is `level_size_multiplier` times smaller, but never smaller than the
    /// base level size. The base level is the highest level whose target fits
    /// the base level size, moved down past empty levels.
    pub fn compute(opts: &LevelsOptions, level_sizes: &[u64]) -> Self {
        let n = level_sizes.len();
        let adjust = |sz: u64| sz.max(opts.base_level_size());
        let mut t = Self {
            base_level: 0,
            target_size: vec![0; n],
            file_size: vec![0; n],
        };

        let mut db_size = level_sizes.last().copied().unwrap_or(0);
        for i in (1..n).rev() {
            let target = adjust(db_size);
            t.target_size[i] = target;
            if t.base_level == 0 && target <= opts.base_level_size() {
                t.base_level = i;
            }
            db_size /= opts.level_size_multiplier();
        }
        // every level is above the base size, compact straight into level 1
        if t.base_level == 0 {
            t.base_level = 1;
        }

        let mut table_size = opts.base_table_size();
        for i in 0..n {
            if i == 0 {
                t.file_size[i] = opts.mem_table_size();
            } else if i <= t.base_level {
                t.file_size[i] = table_size;
            } else {
                table_size = table_size.saturating_mul(opts.table_size_multiplier());
                t.file_size[i] = table_size;
            }
        }

        // bring the base level down to the last empty level
        for i in t.base_level + 1..n.saturating_sub(1) {
            if level_sizes[i] > 0 {
                break;
            }
            t.base_level = i;
        }

        let b = t.base_level;
        if b + 1 < n && level_sizes[b] == 0 && level_sizes[b + 1] < t.target_size[b + 1] {
            t.base_level += 1;
        }
        t
    }
}

/// What the picker reads of a level.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelStatus {
    pub num_tables: usize,
    pub total_size: u64,
    pub value_bytes: u64,
    /// Bytes of the level currently being compacted away.
    pub del_size: u64,
    pub ingest_tables: usize,
    pub ingest_size: u64,
    pub ingest_value_bytes: u64,
    /// Age of the oldest ingest table.
    pub ingest_age: Duration,
}

/// Urgency multiplier of ingest data by age, from 1 up to 4 at 4 minutes.
#[inline]
pub(crate) fn ingest_age_factor(age: Duration) -> f64 {
    (1.0 + age.as_secs_f64() / 80.0).min(4.0)
}

fn value_boost(opts: &LevelsOptions, value_bytes: u64, target: u64) -> f64 {
    if opts.value_weight() <= 0.0 || target == 0 {
        return 0.0;
    }
    opts.value_weight() * (value_bytes as f64 / target as f64).min(16.0)
}

/// Scores every level and returns those needing a compaction, most urgent first.
///
/// A level is returned if its raw score is at least 1. Ranking uses the
/// adjusted score, where a level is dampened by the score of the level below
/// it, so a level whose successor is itself over its target yields.
pub fn pick_compact_levels(
    opts: &LevelsOptions,
    levels: &[LevelStatus],
) -> Vec<CompactionPriority> {
    let sizes = levels.iter().map(|l| l.total_size).collect::<Vec<_>>();
    let targets = Targets::compute(opts, &sizes);
    let mut prios = Vec::with_capacity(levels.len() * 2);

    let l0 = levels.first().copied().unwrap_or_default();
    let l0_target = targets.file_size[0].saturating_mul(opts.num_level_zero_tables() as u64);
    let l0_score = l0.num_tables as f64 / opts.num_level_zero_tables() as f64
        + value_boost(opts, l0.value_bytes, l0_target);
    prios.push(CompactionPriority::new(
        0,
        l0_score,
        IngestMode::None,
        targets.clone(),
    ));

    for (level, l) in levels.iter().enumerate().skip(1) {
        let target = targets.target_size[level];
        let size = l.total_size.saturating_sub(l.del_size);
        let score = size as f64 / target as f64 + value_boost(opts, l.value_bytes, target);
        prios.push(CompactionPriority::new(
            level,
            score,
            IngestMode::None,
            targets.clone(),
        ));
    }

    // dampen each level by the one below it, walking down from the base level
    let mut prev = 0;
    for level in targets.base_level..levels.len() {
        if prios[prev].adjusted >= 1.0 {
            const MIN_SCORE: f64 = 0.01;
            if prios[level].score >= MIN_SCORE {
                prios[prev].adjusted /= prios[level].adjusted;
            } else {
                prios[prev].adjusted /= MIN_SCORE;
            }
        }
        prev = level;
    }

    for (level, l) in levels.iter().enumerate().skip(1) {
        if l.ingest_tables == 0 {
            continue;
        }
        if l.ingest_tables < opts.ingest_backlog_trigger() && l.ingest_age < INGEST_MAX_AGE {
            continue;
        }

        let file_size = targets.file_size[level];
        let base = (l.ingest_size as f64 / file_size as f64).max(1.0);
        let score = base * ingest_age_factor(l.ingest_age)
            + value_boost(opts, l.ingest_value_bytes, file_size);
        prios.push(CompactionPriority::new(
            level,
            score,
            IngestMode::Drain,
            targets.clone(),
        ));

        let keep_threshold = if l.ingest_age >= INGEST_MAX_AGE {
            1.0
        } else if score > 8.0 {
            1.5
        } else {
            2.0
        };
        if score >= keep_threshold {
            let mut keep = CompactionPriority::new(level, score, IngestMode::Keep, targets.clone());
            keep.adjusted = score * 0.8;
            prios.push(keep);
        }
    }

    prios.retain(|p| p.score >= 1.0);
    prios.sort_by(|a, b| b.adjusted.total_cmp(&a.adjusted));
    prios
}

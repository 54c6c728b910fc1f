use std::collections::HashMap;

use crossbeam_channel::{bounded, Receiver, Sender};
use vela_options::LevelsOptions;

/// Bytes of value log data dropped by a compaction, per value log file id.
pub type DiscardStats = HashMap<u32, u64>;

/// Creates the channel compactions report [`DiscardStats`] on, holding up to
/// [`LevelsOptions::discard_channel_capacity`] reports.
///
/// Compactions never block on it: a report that finds the channel full is
/// dropped and counted by [`CompactionMetrics::on_discard_stats_dropped`].
///
/// [`CompactionMetrics::on_discard_stats_dropped`]: vela_traits::CompactionMetrics::on_discard_stats_dropped
#[inline]
pub fn discard_channel(opts: &LevelsOptions) -> (Sender<DiscardStats>, Receiver<DiscardStats>) {
    bounded(opts.discard_channel_capacity().max(1))
}

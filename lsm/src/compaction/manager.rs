use std::time::Duration;

use crossbeam_channel::{select, tick};
use rand::Rng;
use vela_utils::Closer;

use super::CompactionPriority;
use crate::{error::Error, levels::Core};

/// Moves the level 0 priority, if any, to the front.
pub(crate) fn move_l0_to_front(mut prios: Vec<CompactionPriority>) -> Vec<CompactionPriority> {
    if let Some(idx) = prios.iter().position(|p| p.level == 0) {
        if idx > 0 {
            let l0 = prios.remove(idx);
            prios.insert(0, l0);
        }
    }
    prios
}

impl Core {
    /// Body of a compaction worker thread.
    pub(crate) fn run_compactor(&self, id: usize, closer: Closer) {
        scopeguard::defer!(closer.done());

        // spread the workers out
        let jitter = rand::thread_rng().gen_range(0..1000);
        if closer.sleep(Duration::from_millis(jitter)) {
            return;
        }

        tracing::debug!(target: "compaction", worker = id, "compaction worker started");
        let ticker = tick(self.opts.compaction_interval());
        loop {
            select! {
                recv(ticker) -> _ => {},
                recv(self.trigger_rx) -> _ => {},
                recv(closer.has_been_closed()) -> _ => break,
            }
            if closer.is_closed() {
                break;
            }

            if id == 0 {
                self.check_write_throttle();
            }
            // more work is pending, wake a worker without waiting for the tick
            if self.run_once(id) && !self.pick_compact_levels().is_empty() {
                self.trigger();
            }
        }
        tracing::debug!(target: "compaction", worker = id, "compaction worker stopped");
    }

    /// Runs the first compaction that can be planned. Returns true if one ran.
    pub(crate) fn run_once(&self, id: usize) -> bool {
        let mut prios = self.pick_compact_levels();
        if id == 0 {
            // worker 0 always tries level 0, so it never starves
            prios = move_l0_to_front(prios);
        }

        for p in prios {
            if !(id == 0 && p.level == 0) && p.adjusted < 1.0 {
                break;
            }
            let level = p.level;
            match self.do_compact(id, p) {
                Ok(()) => return true,
                Err(Error::FillTables) => {}
                Err(e) => {
                    tracing::warn!(target: "compaction", worker = id, level, err = %e, "error while running compaction");
                }
            }
        }
        false
    }

    /// Turns the write throttle on when level 0 holds more than twice the
    /// compaction trigger, and off once it is back at the trigger.
    pub(crate) fn check_write_throttle(&self) {
        let count = self.levels[0].num_tables();
        let trigger = self.opts.num_level_zero_tables();
        let throttled = self.write_throttled();
        if !throttled && count > 2 * trigger {
            tracing::info!(target: "compaction", tables = count, "level 0 is behind, throttling writes");
            self.set_write_throttled(true);
        } else if throttled && count <= trigger {
            tracing::info!(target: "compaction", tables = count, "level 0 caught up, releasing writes");
            self.set_write_throttled(false);
        }
    }
}

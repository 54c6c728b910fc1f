use core::sync::atomic::{AtomicBool, Ordering};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use wg::WaitGroup;

/// Throttle allows a limited number of tasks to run concurrently and keeps the
/// first error reported by them.
///
/// Call [`Throttle::acquire`] before starting a task, and [`Throttle::done`]
/// exactly once when the task finishes. [`Throttle::finish`] waits for every
/// admitted task.
#[derive(Debug)]
pub struct Throttle<E> {
    wg: WaitGroup,
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    failed: AtomicBool,
    err: Mutex<Option<E>>,
}

impl<E> Throttle<E> {
    /// Creates a throttle admitting at most `max` tasks at once.
    pub fn new(max: usize) -> Self {
        let (slot_tx, slot_rx) = bounded(max.max(1));
        Self {
            wg: WaitGroup::new(),
            slot_tx,
            slot_rx,
            failed: AtomicBool::new(false),
            err: Mutex::new(None),
        }
    }

    /// Blocks until a slot is free. Returns false without taking a slot if a
    /// task already failed, so the caller stops scheduling new work.
    pub fn acquire(&self) -> bool {
        if self.is_failed() {
            return false;
        }
        // the channel owns both ends, so send only fails if it is full, which blocks instead
        if self.slot_tx.send(()).is_err() {
            return false;
        }
        self.wg.add(1);
        true
    }

    /// Releases the slot of a finished task, recording its error if it is the first one.
    pub fn done(&self, res: Result<(), E>) {
        if let Err(e) = res {
            let mut err = self.err.lock();
            if err.is_none() {
                *err = Some(e);
            }
            self.failed.store(true, Ordering::Release);
        }
        let _ = self.slot_rx.try_recv();
        self.wg.done();
    }

    /// Returns true once any task has reported an error.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Waits for all admitted tasks, returning the first error reported.
    pub fn finish(self) -> Result<(), E> {
        self.wg.wait();
        match self.err.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

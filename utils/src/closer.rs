use arc_swap::ArcSwapOption;
use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use wg::WaitGroup;

/// Closer holds the two things we need to close a thread and wait for it to
/// finish: a chan to tell the thread to shut down, and a WaitGroup with
/// which to wait for it to finish shutting down.
///
/// The shutdown signal is the disconnection of the channel returned by
/// [`Closer::has_been_closed`], so every receiver observes it, however many
/// threads select on it.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct Closer {
    inner: Arc<CloserInner>,
}

#[derive(Debug)]
struct CloserInner {
    wg: WaitGroup,
    tx: ArcSwapOption<Sender<()>>,
    rx: Receiver<()>,
    closed: AtomicBool,
}

impl CloserInner {
    #[inline]
    fn new(initial: usize) -> Self {
        let (tx, rx) = unbounded();
        let wg = WaitGroup::new();
        if initial > 0 {
            wg.add(initial);
        }
        Self {
            wg,
            tx: ArcSwapOption::from_pointee(tx),
            rx,
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Closer {
    /// Constructs a new [`Closer`], with an initial count on the [`WaitGroup`].
    #[inline]
    pub fn new(initial: usize) -> Self {
        Self {
            inner: Arc::new(CloserInner::new(initial)),
        }
    }

    /// Adds delta to the [`WaitGroup`].
    #[inline]
    pub fn add_running(&self, running: usize) {
        self.inner.wg.add(running);
    }

    /// Calls [`WaitGroup::done`] on the [`WaitGroup`].
    #[inline]
    pub fn done(&self) {
        self.inner.wg.done();
    }

    /// Signals the [`Closer::has_been_closed`] signal. Calling it more than once is a no-op.
    #[inline]
    pub fn signal(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.tx.swap(None);
    }

    /// Returns true once [`Closer::signal`] has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Gets signaled when [`Closer::signal`] is called: receiving on it returns
    /// a disconnected error from then on.
    #[inline]
    pub fn has_been_closed(&self) -> &Receiver<()> {
        &self.inner.rx
    }

    /// Sleeps for `dur` or until the closer is signaled. Returns true if the
    /// closer has been signaled.
    #[inline]
    pub fn sleep(&self, dur: Duration) -> bool {
        match self.inner.rx.recv_timeout(dur) {
            Err(RecvTimeoutError::Timeout) => false,
            _ => true,
        }
    }

    /// Waits on the [`WaitGroup`]. (It waits for the Closer's initial value, [`Closer::add_running`], and [`Closer::done`]
    /// calls to balance out.)
    #[inline]
    pub fn wait(&self) {
        self.inner.wg.wait();
    }

    /// Calls [`Closer::signal`], then [`Closer::wait`].
    #[inline]
    pub fn signal_and_wait(&self) {
        self.signal();
        self.wait();
    }
}

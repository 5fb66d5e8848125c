use crate::device::{DeviceError, Stream};
use crate::runtime::scheduler::Handle;
use crate::task::Runnable;
use crossbeam_deque::Worker as Deque;
use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering;
use std::thread;

/// Yield-backoff cycles before giving up on task exploration and entering
/// the idle protocol.
const MAX_EXPLORE_YIELDS: usize = 100;

/// Yield-backoff cycles before giving up on stream stealing and creating a
/// fresh stream instead.
const MAX_STREAM_YIELDS: usize = 10;

/// One scheduling thread: a private task deque, a private stream pool, a
/// randomised steal victim, and a slot in the idle notifier (indexed by
/// `id`). Owner side pushes/pops LIFO; peers steal FIFO through the
/// [`Remote`](crate::runtime::scheduler::Remote) handles in the core.
pub(crate) struct Worker {
    pub(crate) id: usize,
    handle: Handle,
    queue: Deque<Runnable>,
    streams: Deque<Stream>,

    /// Current steal victim; rolling one's own id probes the global queue.
    victim: Cell<usize>,
    rng: RefCell<fastrand::Rng>,
    max_steals: usize,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        handle: Handle,
        queue: Deque<Runnable>,
        streams: Deque<Stream>,
    ) -> Self {
        let max_steals = handle.cfg.max_steals();
        Self {
            id,
            handle,
            queue,
            streams,
            victim: Cell::new(id),
            rng: RefCell::new(fastrand::Rng::new()),
            max_steals,
        }
    }

    /// The explore/exploit loop. Exits when the stop flag is observed in
    /// the idle dance, then drains the stream pool.
    pub(crate) fn run(self) {
        loop {
            self.exploit();
            if !self.wait_for_task() {
                break;
            }
        }
        self.drain_streams();
    }

    pub(crate) fn push_task(&self, runnable: Runnable) {
        self.queue.push(runnable);
    }

    pub(crate) fn release_stream(&self, stream: Stream) {
        self.streams.push(stream);
    }

    /// Drain the private deque, processing each task as it is popped.
    fn exploit(&self) {
        while let Some(runnable) = self.queue.pop() {
            self.handle.process(self, runnable);
        }
    }

    /// Bounded steal attempts against random victims. At least one attempt
    /// is made per call even when stopping, so queued work drains during
    /// shutdown.
    fn explore(&self) -> Option<Runnable> {
        let remotes = self.handle.remotes();
        let mut num_steals = 0_usize;
        let mut num_yields = 0_usize;

        loop {
            let stolen = if self.victim.get() == self.id {
                self.handle.pop_global()
            } else {
                remotes[self.victim.get()].tasks.steal().success()
            };

            if stolen.is_some() {
                return stolen;
            }

            num_steals += 1;
            if num_steals > self.max_steals {
                thread::yield_now();
                num_yields += 1;
                if num_yields > MAX_EXPLORE_YIELDS {
                    return None;
                }
            }

            self.victim.set(self.rng.borrow_mut().usize(..remotes.len()));

            if self.handle.stop.load(Ordering::Acquire) {
                return None;
            }
        }
    }

    /// Explore until a task is found, or sleep through the two-phase-commit
    /// idle protocol. Returns false when the worker should exit.
    fn wait_for_task(&self) -> bool {
        let notifier = &self.handle.notifier;

        loop {
            if let Some(runnable) = self.explore() {
                // Compensate the victim for the work we took from it.
                notifier.notify_one();
                self.handle.process(self, runnable);
                return true;
            }

            notifier.prepare_wait(self.id);

            if !self.handle.global_is_empty() {
                notifier.cancel_wait(self.id);
                self.victim.set(self.id);
                continue;
            }

            if self.handle.stop.load(Ordering::SeqCst) {
                notifier.cancel_wait(self.id);
                notifier.notify_all();
                return false;
            }

            // A randomised probe can miss a single non-empty queue under
            // adversarial interleavings; scan in index order before
            // committing to sleep.
            let remotes = self.handle.remotes();
            if let Some(victim) = (0..remotes.len()).find(|&v| !remotes[v].tasks.is_empty()) {
                notifier.cancel_wait(self.id);
                self.victim.set(victim);
                continue;
            }

            notifier.commit_wait(self.id);
        }
    }

    /// Stream acquisition for a device suspension: pop the own pool, fall
    /// back to stealing across peers, create a fresh stream only if all of
    /// that fails.
    pub(crate) fn acquire_stream(&self) -> Result<Stream, DeviceError> {
        if let Some(stream) = self.streams.pop() {
            return Ok(stream);
        }

        let remotes = self.handle.remotes();
        if remotes.len() > 1 {
            let mut num_steals = 0_usize;
            let mut num_yields = 0_usize;

            while !self.handle.stop.load(Ordering::Acquire) {
                let victim = self.rng.borrow_mut().usize(..remotes.len());
                if victim == self.id {
                    continue;
                }

                if let Some(stream) = remotes[victim].streams.steal().success() {
                    return Ok(stream);
                }

                num_steals += 1;
                if num_steals > self.max_steals {
                    thread::yield_now();
                    num_yields += 1;
                    if num_yields > MAX_STREAM_YIELDS {
                        break;
                    }
                }
            }
        }

        self.handle.driver.stream_create()
    }

    /// Pooled streams die with the worker; in-flight ones are reclaimed by
    /// the scheduler once the last callback lands.
    fn drain_streams(&self) {
        while let Some(stream) = self.streams.pop() {
            if let Err(e) = self.handle.driver.stream_destroy(stream) {
                tracing::error!(%stream, %e, "failed to destroy pooled stream");
            }
        }
    }
}

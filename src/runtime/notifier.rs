use parking_lot::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaitState {
    /// Not in the idle protocol.
    Idle,
    /// Intends to sleep; still rechecking queues.
    Prepared,
    /// Blocked on the condvar.
    Committed,
    /// A notify landed here; consumed by commit or cancel.
    Signaled,
}

struct Waiter {
    state: Mutex<WaitState>,
    cv: Condvar,
}

/// Two-phase-commit waiter registry, one slot per worker.
///
/// A worker that finds no work runs `prepare_wait`, rechecks every queue,
/// then either `cancel_wait` (work appeared) or `commit_wait` (block until
/// notified). Producers push work first and notify second.
///
/// Every transition takes the slot lock, so there is no racy fast path: if
/// a producer's notify scan sees a slot still `Idle`, the slot mutex
/// hand-off orders the producer's push before that worker's post-prepare
/// queue recheck, and the recheck finds the work. If the scan sees
/// `Prepared` or `Committed`, the slot is signaled. Either way the wakeup
/// is not lost.
pub(crate) struct Notifier {
    waiters: Box<[Waiter]>,
}

impl Notifier {
    pub(crate) fn new(num_waiters: usize) -> Self {
        let waiters = (0..num_waiters)
            .map(|_| Waiter {
                state: Mutex::new(WaitState::Idle),
                cv: Condvar::new(),
            })
            .collect();

        Self { waiters }
    }

    pub(crate) fn prepare_wait(&self, slot: usize) {
        let mut state = self.waiters[slot].state.lock();
        debug_assert_eq!(*state, WaitState::Idle);
        *state = WaitState::Prepared;
    }

    /// Leaves the idle protocol without blocking. A signal already parked
    /// on this slot is consumed: the canceling worker is awake and about to
    /// re-explore, which is all the signal was for.
    pub(crate) fn cancel_wait(&self, slot: usize) {
        let mut state = self.waiters[slot].state.lock();
        debug_assert_ne!(*state, WaitState::Committed);
        *state = WaitState::Idle;
    }

    /// Blocks until a notify lands on this slot. Returns immediately if one
    /// landed between prepare and commit.
    pub(crate) fn commit_wait(&self, slot: usize) {
        let waiter = &self.waiters[slot];
        let mut state = waiter.state.lock();

        match *state {
            WaitState::Signaled => {
                *state = WaitState::Idle;
                return;
            }
            WaitState::Prepared => *state = WaitState::Committed,
            other => unreachable!("commit_wait from {other:?}"),
        }

        while *state == WaitState::Committed {
            waiter.cv.wait(&mut state);
        }

        debug_assert_eq!(*state, WaitState::Signaled);
        *state = WaitState::Idle;
    }

    /// Wakes one waiter. Committed sleepers first; a merely prepared waiter
    /// will recheck the queues on its own before blocking. Idempotent and
    /// cheap when nobody is in the protocol.
    pub(crate) fn notify_one(&self) {
        for waiter in &self.waiters {
            let mut state = waiter.state.lock();
            if *state == WaitState::Committed {
                *state = WaitState::Signaled;
                waiter.cv.notify_one();
                return;
            }
        }

        for waiter in &self.waiters {
            let mut state = waiter.state.lock();
            if *state == WaitState::Prepared {
                *state = WaitState::Signaled;
                return;
            }
        }
    }

    /// Wakes every waiter currently in the protocol. Used for termination.
    pub(crate) fn notify_all(&self) {
        for waiter in &self.waiters {
            let mut state = waiter.state.lock();
            match *state {
                WaitState::Committed => {
                    *state = WaitState::Signaled;
                    waiter.cv.notify_one();
                }
                WaitState::Prepared => *state = WaitState::Signaled,
                WaitState::Idle | WaitState::Signaled => {}
            }
        }
    }
}

use crate::device::Kernel;

/// What a suspendable body does at each yield point.
pub enum Yield {
    /// Plain suspend: the task is immediately re-enqueued on the current
    /// worker and will be resumed by whichever worker picks it up.
    Suspend,

    /// Device suspend: the scheduler acquires a stream, submits the kernel,
    /// and registers a host callback that re-enqueues this task once the
    /// stream drains.
    Device(Kernel),

    /// The body has run to completion. Terminal; the scheduler never
    /// resumes a body past this point.
    Done,
}

/// A resumable computation, possibly migrating between workers across
/// yield points.
///
/// This is the state-machine rendering of a coroutine: each call to
/// `resume` advances the body to its next yield point and reports it. Local
/// state lives in the implementor (for closures, in the captures), and the
/// implementor tracks which step comes next.
///
/// ```
/// use strand::Yield;
///
/// let mut step = 0;
/// let body = move || {
///     step += 1;
///     if step < 3 { Yield::Suspend } else { Yield::Done }
/// };
/// # let _: Box<dyn strand::Suspendable> = Box::new(body);
/// ```
///
/// The scheduler guarantees resumes on one task never overlap: every call
/// runs under the task's resumption lock.
pub trait Suspendable: Send + 'static {
    /// Advances the body to its next yield point.
    fn resume(&mut self) -> Yield;
}

impl<F> Suspendable for F
where
    F: FnMut() -> Yield + Send + 'static,
{
    fn resume(&mut self) -> Yield {
        self()
    }
}

/// Everything guarded by a suspendable task's resumption lock: the body
/// itself and the final flag, which must only be read under the lock.
pub(crate) struct SuspendState {
    pub(crate) body: Box<dyn Suspendable>,
    pub(crate) done: bool,
}

impl SuspendState {
    pub(crate) fn new(body: Box<dyn Suspendable>) -> Self {
        Self { body, done: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_body_advances_one_yield_per_resume() {
        let mut step = 0;
        let mut state = SuspendState::new(Box::new(move || {
            step += 1;
            if step < 3 { Yield::Suspend } else { Yield::Done }
        }));

        assert!(matches!(state.body.resume(), Yield::Suspend));
        assert!(matches!(state.body.resume(), Yield::Suspend));
        assert!(matches!(state.body.resume(), Yield::Done));
    }
}

use crate::device::DeviceError;

/// A centralized error type for scheduler operations.
///
/// There is no in-flight retry or partial-failure recovery; the unit of reuse
/// is the whole task graph. Any variant other than
/// [`GraphCycle`](SchedulerError::GraphCycle) and
/// [`AlreadyScheduled`](SchedulerError::AlreadyScheduled) is fatal to the
/// current run and is surfaced by [`Scheduler::wait`](crate::Scheduler::wait).
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    /// The task graph contains a directed cycle. `schedule` refuses to run
    /// cyclic graphs.
    #[error("task graph contains a cycle")]
    GraphCycle,

    /// `schedule` was called twice on the same scheduler.
    #[error("task graph has already been scheduled")]
    AlreadyScheduled,

    /// The device runtime rejected a kernel or host-callback submission.
    #[error("device submission failed: {0}")]
    DeviceSubmit(#[from] DeviceError),

    /// A task body panicked. The first panic wins; later ones are dropped.
    #[error("task body panicked: {0}")]
    BodyPanic(String),
}

/// Best-effort rendering of a `catch_unwind` payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

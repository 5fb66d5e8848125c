//! Task graph nodes and the handles the front-end builds graphs with.

use crate::device::Stream;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

mod suspend;
pub use suspend::{Suspendable, Yield};
pub(crate) use suspend::SuspendState;

/// A task's index in the owning scheduler. Dense and immutable after
/// creation; edges store these instead of pointers.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskId(pub(crate) usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A lightweight reference to an emplaced task, returned by the `emplace_*`
/// family and consumed by [`Scheduler::precede`](crate::Scheduler::precede)
/// and [`Scheduler::succeed`](crate::Scheduler::succeed).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TaskHandle(pub(crate) TaskId);

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.0
    }
}

pub(crate) type StaticWork = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum TaskKind {
    /// Plain CPU work, runs exactly once.
    Static(Mutex<Option<StaticWork>>),

    /// A resumable body behind its resumption lock. The lock is held for
    /// the whole duration of a resume; the final flag lives inside it so it
    /// can only be read under the lock.
    Suspendable(Mutex<SuspendState>),
}

/// A node in the task graph.
///
/// Edge lists are written only during single-threaded graph construction
/// and are read-only while workers run; the join counter is the only field
/// mutated during scheduling.
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) succs: SmallVec<[TaskId; 4]>,
    pub(crate) preds: SmallVec<[TaskId; 4]>,

    /// Number of predecessors that have not yet reached their final state.
    /// The task is enqueued exactly when this reaches zero.
    pub(crate) join_counter: AtomicUsize,
}

impl Task {
    pub(crate) fn new_static<F>(id: TaskId, work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(id, TaskKind::Static(Mutex::new(Some(Box::new(work)))))
    }

    pub(crate) fn new_suspendable<B>(id: TaskId, body: B) -> Self
    where
        B: Suspendable,
    {
        Self::new(
            id,
            TaskKind::Suspendable(Mutex::new(SuspendState::new(Box::new(body)))),
        )
    }

    fn new(id: TaskId, kind: TaskKind) -> Self {
        Self {
            id,
            kind,
            succs: SmallVec::new(),
            preds: SmallVec::new(),
            join_counter: AtomicUsize::new(0),
        }
    }

    pub(crate) fn num_preds(&self) -> usize {
        self.preds.len()
    }
}

/// Adds the edge `parent -> child`. Construction is single-threaded, so the
/// join-counter bump can be relaxed.
pub(crate) fn precede(tasks: &mut [Task], parent: TaskId, child: TaskId) {
    tasks[parent.0].succs.push(child);
    tasks[child.0].preds.push(parent);
    tasks[child.0].join_counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first three-colour cycle check. Any edge back to an on-stack node
/// means the graph is not schedulable.
pub(crate) fn is_acyclic(tasks: &[Task]) -> bool {
    let mut colors = vec![Color::Unvisited; tasks.len()];

    for root in 0..tasks.len() {
        if colors[root] != Color::Unvisited {
            continue;
        }

        colors[root] = Color::OnStack;
        let mut stack = vec![(root, 0_usize)];

        while let Some((node, cursor)) = stack.last_mut() {
            let node = *node;
            if let Some(&succ) = tasks[node].succs.get(*cursor) {
                *cursor += 1;
                match colors[succ.0] {
                    Color::Unvisited => {
                        colors[succ.0] = Color::OnStack;
                        stack.push((succ.0, 0));
                    }
                    Color::OnStack => return false,
                    Color::Done => {}
                }
            } else {
                colors[node] = Color::Done;
                stack.pop();
            }
        }
    }

    true
}

/// The trampoline record a device suspension leaves behind: executed by
/// whichever worker picks it up after the host callback re-enqueues it.
/// The stream migrates to that worker's pool, and the suspended task is
/// re-enqueued under its resumption lock so the resume that registered the
/// callback has fully unwound first.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InnerTask {
    pub(crate) task: TaskId,
    pub(crate) stream: Stream,
}

/// What worker deques and the global overflow queue carry.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Runnable {
    Node(TaskId),
    Inner(InnerTask),
}

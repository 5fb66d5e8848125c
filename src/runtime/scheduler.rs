use crate::device::{DeviceDriver, Kernel, Stream};
use crate::error::{SchedulerError, panic_message};
use crate::runtime::builder::{Builder, RuntimeConfig};
use crate::runtime::notifier::Notifier;
use crate::runtime::worker::Worker;
use crate::task::{
    self, InnerTask, Runnable, Suspendable, Task, TaskHandle, TaskId, TaskKind, Yield,
};
use crossbeam_deque::{Stealer, Worker as Deque};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock};
use std::thread;

/// The steal side of one worker's queues, shared with every other worker
/// (and with the pre-sleep index-order scan).
pub(crate) struct Remote {
    pub(crate) tasks: Stealer<Runnable>,
    pub(crate) streams: Stealer<Stream>,
}

/// State shared between the public [`Scheduler`], its workers, and any
/// host-callback threads the device runtime owns.
pub(crate) struct Core {
    pub(crate) cfg: RuntimeConfig,
    pub(crate) driver: Arc<dyn DeviceDriver>,
    pub(crate) notifier: Notifier,

    /// The task graph, frozen at `schedule()`. Read-only from then on;
    /// only the join counters are mutated while workers run.
    tasks: OnceLock<Box<[Task]>>,

    /// Steal handles for every worker, installed when the pool spawns.
    remotes: OnceLock<Box<[Remote]>>,

    /// Shared overflow queue. Contention is rare (seeding and host
    /// callbacks), so a plain lock does.
    global: Mutex<VecDeque<Runnable>>,

    pub(crate) stop: AtomicBool,
    finished: AtomicUsize,

    /// Callbacks registered with the device but not yet fully returned.
    /// `wait()` spins this to zero after joining workers so no callback
    /// thread can touch the notifier after teardown.
    pub(crate) callbacks_in_flight: AtomicUsize,

    /// First fatal failure wins; later ones are dropped.
    failure: Mutex<Option<SchedulerError>>,
}

impl Core {
    fn new(cfg: RuntimeConfig, driver: Arc<dyn DeviceDriver>) -> Self {
        let notifier = Notifier::new(cfg.worker_threads);
        Self {
            cfg,
            driver,
            notifier,
            tasks: OnceLock::new(),
            remotes: OnceLock::new(),
            global: Mutex::new(VecDeque::new()),
            stop: AtomicBool::new(false),
            finished: AtomicUsize::new(0),
            callbacks_in_flight: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn tasks(&self) -> &[Task] {
        self.tasks.get().expect("task graph not frozen")
    }

    fn task(&self, id: TaskId) -> &Task {
        &self.tasks()[id.0]
    }

    pub(crate) fn remotes(&self) -> &[Remote] {
        self.remotes.get().expect("worker pool not spawned")
    }

    pub(crate) fn push_global(&self, runnable: Runnable) {
        self.global.lock().push_back(runnable);
    }

    pub(crate) fn pop_global(&self) -> Option<Runnable> {
        self.global.lock().pop_front()
    }

    pub(crate) fn global_is_empty(&self) -> bool {
        self.global.lock().is_empty()
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notifier.notify_all();
    }

    /// Records the first fatal failure, then stops the run.
    pub(crate) fn fail(&self, err: SchedulerError) {
        tracing::error!(%err, "fatal scheduler failure");
        {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.request_stop();
    }

    fn take_failure(&self) -> Option<SchedulerError> {
        self.failure.lock().take()
    }

    /// Destroys streams stranded in undelivered inner tasks (only possible
    /// after an aborted run).
    fn reclaim_stranded_streams(&self) {
        let mut global = self.global.lock();
        while let Some(runnable) = global.pop_front() {
            if let Runnable::Inner(inner) = runnable {
                let _ = self.driver.stream_destroy(inner.stream);
            }
        }
    }
}

#[cfg(test)]
impl Core {
    pub(crate) fn finished_count(&self) -> usize {
        self.finished.load(Ordering::Relaxed)
    }

    pub(crate) fn outstanding_callbacks(&self) -> usize {
        self.callbacks_in_flight.load(Ordering::SeqCst)
    }
}

/// Cheap clonable reference to the shared core; what workers and host
/// callbacks hold.
#[derive(Clone)]
pub(crate) struct Handle(Arc<Core>);

impl Deref for Handle {
    type Target = Core;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Handle {
    /// Runs one popped/stolen item, tail-chaining through ready successors
    /// without touching the deque.
    pub(crate) fn process(&self, worker: &Worker, runnable: Runnable) {
        let mut current = Some(runnable);
        while let Some(runnable) = current.take() {
            let next = match runnable {
                Runnable::Node(id) => match &self.task(id).kind {
                    TaskKind::Static(_) => self.invoke_static(worker, id),
                    TaskKind::Suspendable(_) => self.invoke_suspendable(worker, id),
                },
                Runnable::Inner(inner) => {
                    self.invoke_inner(worker, inner);
                    None
                }
            };
            current = next.map(Runnable::Node);
        }
    }

    fn invoke_static(&self, worker: &Worker, id: TaskId) -> Option<TaskId> {
        let task = self.task(id);
        let TaskKind::Static(work) = &task.kind else {
            unreachable!("static dispatch on non-static task")
        };

        let work = work.lock().take();
        debug_assert!(work.is_some(), "static task {id} ran twice");

        if let Some(work) = work
            && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work))
        {
            self.fail(SchedulerError::BodyPanic(panic_message(payload)));
            return None;
        }

        self.finish(worker, task)
    }

    fn invoke_suspendable(&self, worker: &Worker, id: TaskId) -> Option<TaskId> {
        let task = self.task(id);
        let TaskKind::Suspendable(lock) = &task.kind else {
            unreachable!("suspendable dispatch on non-suspendable task")
        };

        // The resumption lock is held for the entire resume, including the
        // yield point's side effects below. A device callback can fire
        // before this resume unwinds; the inner task it enqueues blocks on
        // this same lock, so a second resume cannot start until we return.
        let mut state = lock.lock();
        let step = panic::catch_unwind(AssertUnwindSafe(|| state.body.resume()));

        match step {
            Err(payload) => {
                drop(state);
                self.fail(SchedulerError::BodyPanic(panic_message(payload)));
                None
            }
            Ok(Yield::Done) => {
                state.done = true;
                drop(state);
                self.finish(worker, task)
            }
            Ok(Yield::Suspend) => {
                worker.push_task(Runnable::Node(id));
                self.notifier.notify_one();
                None
            }
            Ok(Yield::Device(kernel)) => {
                self.device_suspend(worker, id, kernel);
                None
            }
        }
    }

    /// The trampoline between a host callback and the suspended task: the
    /// stream migrates to this worker's pool, and the task is re-enqueued
    /// under its resumption lock so the resume that registered the callback
    /// has fully unwound first.
    fn invoke_inner(&self, worker: &Worker, inner: InnerTask) {
        worker.release_stream(inner.stream);

        let task = self.task(inner.task);
        let TaskKind::Suspendable(lock) = &task.kind else {
            unreachable!("inner task bound to non-suspendable task")
        };

        let _resume = lock.lock();
        worker.push_task(Runnable::Node(inner.task));
        self.notifier.notify_one();
    }

    /// Submits `kernel` and registers the host callback that will bring the
    /// task back. Runs under the task's resumption lock.
    fn device_suspend(&self, worker: &Worker, id: TaskId, kernel: Kernel) {
        let stream = match worker.acquire_stream() {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(SchedulerError::DeviceSubmit(e));
                return;
            }
        };

        // Incremented before anything is launched and decremented as the
        // callback's final action: wait() may not return while a callback
        // thread can still reach the notifier.
        self.callbacks_in_flight.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.driver.launch_kernel(kernel, &stream) {
            self.callbacks_in_flight.fetch_sub(1, Ordering::SeqCst);
            worker.release_stream(stream);
            self.fail(SchedulerError::DeviceSubmit(e));
            return;
        }

        let callback = {
            let handle = self.clone();
            let inner = InnerTask { task: id, stream };
            Box::new(move || {
                tracing::trace!(task = %inner.task, stream = %inner.stream, "host callback fired");
                handle.push_global(Runnable::Inner(inner));
                handle.notifier.notify_one();
                handle.callbacks_in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        };

        if let Err(e) = self.driver.launch_host_callback(&stream, callback) {
            self.callbacks_in_flight.fetch_sub(1, Ordering::SeqCst);
            worker.release_stream(stream);
            self.fail(SchedulerError::DeviceSubmit(e));
        }
    }

    /// Completion protocol: decrement every successor's join counter. The
    /// first successor that hits zero is returned for tail-chaining; the
    /// rest go onto this worker's deque with one waiter notified each.
    fn finish(&self, worker: &Worker, task: &Task) -> Option<TaskId> {
        let tasks = self.tasks();
        let mut next = None;

        for &succ in &task.succs {
            if tasks[succ.0].join_counter.fetch_sub(1, Ordering::AcqRel) == 1 {
                if next.is_none() {
                    next = Some(succ);
                    continue;
                }
                worker.push_task(Runnable::Node(succ));
                self.notifier.notify_one();
            }
        }

        if self.finished.fetch_add(1, Ordering::AcqRel) + 1 == tasks.len() {
            tracing::debug!("all tasks finished");
            self.request_stop();
        }

        next
    }

    fn spawn_pool(&self) -> Vec<thread::JoinHandle<()>> {
        let num_workers = self.cfg.worker_threads;

        let mut locals = Vec::with_capacity(num_workers);
        let mut remotes = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let queue = Deque::new_lifo();
            let streams = Deque::new_lifo();
            remotes.push(Remote {
                tasks: queue.stealer(),
                streams: streams.stealer(),
            });
            locals.push((queue, streams));
        }

        let installed = self.remotes.set(remotes.into_boxed_slice());
        assert!(installed.is_ok(), "worker pool already spawned");

        // Spawning threads is async; don't seed until every worker is up.
        let barrier = Arc::new(Barrier::new(num_workers + 1));

        let handles = locals
            .into_iter()
            .enumerate()
            .map(|(id, (queue, streams))| {
                let worker = Worker::new(id, self.clone(), queue, streams);
                let barrier = Arc::clone(&barrier);

                let mut builder = thread::Builder::new().name(self.cfg.thread_name.next());
                if let Some(stack_size) = self.cfg.thread_stack_size {
                    builder = builder.stack_size(stack_size);
                }

                builder
                    .spawn(move || {
                        barrier.wait();
                        worker.run();
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        barrier.wait();
        handles
    }

    /// Pushes every zero-join task onto the global queue; returns how many.
    fn seed_sources(&self) -> usize {
        let tasks = self.tasks();
        let mut global = self.global.lock();
        let mut seeded = 0;

        for task in tasks {
            if task.join_counter.load(Ordering::Relaxed) == 0 {
                debug_assert_eq!(task.num_preds(), 0, "source task {} has predecessors", task.id);
                global.push_back(Runnable::Node(task.id));
                seeded += 1;
            }
        }

        seeded
    }
}

/// The task-DAG scheduler.
///
/// Build the graph with the `emplace_*` family and
/// [`precede`](Scheduler::precede)/[`succeed`](Scheduler::succeed), then
/// [`schedule`](Scheduler::schedule) it and [`wait`](Scheduler::wait) for
/// completion. The graph is sealed once scheduled; the unit of reuse is the
/// whole DAG.
pub struct Scheduler {
    /// The graph under construction; moved into the core at `schedule()`.
    nodes: Vec<Task>,
    handle: Handle,
    threads: Vec<thread::JoinHandle<()>>,
    scheduled: bool,
}

impl Scheduler {
    /// A scheduler with `num_threads` workers. `num_streams` is advisory
    /// and ignored: streams are created lazily on first device suspension.
    pub fn new(num_threads: usize, num_streams: usize) -> Self {
        Builder::new()
            .worker_threads(num_threads)
            .num_streams(num_streams)
            .build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_parts(cfg: RuntimeConfig, driver: Arc<dyn DeviceDriver>) -> Self {
        Self {
            nodes: Vec::new(),
            handle: Handle(Arc::new(Core::new(cfg, driver))),
            threads: Vec::new(),
            scheduled: false,
        }
    }

    /// Adds a task running `work` once on some worker.
    #[track_caller]
    pub fn emplace_static<F>(&mut self, work: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(!self.scheduled, "graph is sealed after schedule()");
        let id = TaskId(self.nodes.len());
        self.nodes.push(Task::new_static(id, work));
        TaskHandle(id)
    }

    /// Adds a suspendable task. The body may yield any number of times and
    /// will be resumed, possibly on different workers, until it reports
    /// [`Yield::Done`].
    #[track_caller]
    pub fn emplace_suspendable<B>(&mut self, body: B) -> TaskHandle
    where
        B: Suspendable,
    {
        assert!(!self.scheduled, "graph is sealed after schedule()");
        let id = TaskId(self.nodes.len());
        self.nodes.push(Task::new_suspendable(id, body));
        TaskHandle(id)
    }

    /// Adds the edge `parent -> child`: `child` runs only after `parent`
    /// reaches its final state.
    #[track_caller]
    pub fn precede(&mut self, parent: TaskHandle, child: TaskHandle) {
        assert!(!self.scheduled, "graph is sealed after schedule()");
        task::precede(&mut self.nodes, parent.0, child.0);
    }

    /// Adds the edge `parent -> child` with the handles flipped.
    #[track_caller]
    pub fn succeed(&mut self, child: TaskHandle, parent: TaskHandle) {
        self.precede(parent, child);
    }

    pub fn num_tasks(&self) -> usize {
        self.graph().len()
    }

    /// True iff the graph contains no directed cycle.
    pub fn is_dag(&self) -> bool {
        task::is_acyclic(self.graph())
    }

    fn graph(&self) -> &[Task] {
        if self.scheduled {
            self.handle.tasks()
        } else {
            &self.nodes
        }
    }

    /// Freezes the graph, spawns the worker pool, and seeds every
    /// zero-join task. Refuses cyclic graphs and second calls.
    pub fn schedule(&mut self) -> Result<(), SchedulerError> {
        if self.scheduled {
            return Err(SchedulerError::AlreadyScheduled);
        }
        if !self.is_dag() {
            return Err(SchedulerError::GraphCycle);
        }
        self.scheduled = true;

        let nodes = std::mem::take(&mut self.nodes);
        let frozen = self.handle.tasks.set(nodes.into_boxed_slice());
        assert!(frozen.is_ok(), "task graph already frozen");

        self.threads = self.handle.spawn_pool();
        let seeded = self.handle.seed_sources();
        tracing::debug!(
            seeded,
            total = self.handle.tasks().len(),
            workers = self.handle.cfg.worker_threads,
            num_streams = self.handle.cfg.num_streams,
            "task graph scheduled"
        );

        if self.handle.tasks().is_empty() {
            // Nothing will ever bump the finished counter.
            self.handle.request_stop();
        } else {
            self.handle.notifier.notify_all();
        }

        Ok(())
    }

    /// Joins all workers, then spins until the last outstanding host
    /// callback has fully returned. Surfaces the first fatal failure of
    /// the run, if any.
    pub fn wait(&mut self) -> Result<(), SchedulerError> {
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                self.handle
                    .fail(SchedulerError::BodyPanic("worker thread panicked".to_owned()));
            }
        }

        // Scheduler state must stay live until the very last callback has
        // performed its final decrement.
        while self.handle.callbacks_in_flight.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }

        self.handle.reclaim_stranded_streams();
        self.handle.take_failure().map_or(Ok(()), Err)
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Core {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.handle.request_stop();
        }
        let _ = self.wait();
    }
}

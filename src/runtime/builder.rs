use crate::device::{DeviceDriver, SimDriver};
use crate::runtime::Scheduler;
use anyhow::{Context, Result};
use std::fmt;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn() -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    pub(crate) fn next(&self) -> String {
        (self.0)()
    }
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    let counter = Arc::new(AtomicUsize::new(0));
    ThreadNameFn(Arc::new(move || {
        let prev = counter.fetch_add(1, Ordering::Relaxed);
        format!("strand-worker-{prev}")
    }))
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,

    /// Advisory; streams are created lazily regardless.
    pub(crate) num_streams: usize,

    pub(crate) thread_name: ThreadNameFn,

    pub(crate) thread_stack_size: Option<usize>,
}

impl RuntimeConfig {
    /// Steal attempts per exploration round before backing off.
    pub(crate) fn max_steals(&self) -> usize {
        (self.worker_threads + 1) << 1
    }
}

/// Configures a [`Scheduler`].
///
/// ```
/// use strand::Builder;
///
/// let scheduler = Builder::new()
///     .worker_threads(4)
///     .thread_name("pipeline-worker")
///     .build();
/// # drop(scheduler);
/// ```
pub struct Builder {
    /// The number of worker threads.
    ///
    /// Defaults to 1 worker per CPU core.
    worker_threads: Option<usize>,

    /// Kept for API compatibility with stream-count tuning knobs; streams
    /// are created lazily, so this changes nothing.
    num_streams: usize,

    /// Name fn used for threads spawned by the scheduler.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the scheduler.
    thread_stack_size: Option<usize>,

    /// Device runtime to submit kernels and host callbacks to.
    device: Option<Arc<dyn DeviceDriver>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            num_streams: 0,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            device: None,
        }
    }

    pub fn worker_threads(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    pub fn num_streams(&mut self, val: usize) -> &mut Self {
        self.num_streams = val;
        self
    }

    /// Sets the name of threads spawned by the scheduler.
    ///
    /// The default name is "strand-worker-{N}".
    pub fn thread_name(&mut self, val: impl Into<String>) -> &mut Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// scheduler.
    pub fn thread_name_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    pub fn thread_stack_size(&mut self, val: usize) -> &mut Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Overrides the device runtime. Defaults to the software
    /// [`SimDriver`].
    pub fn device(&mut self, driver: Arc<dyn DeviceDriver>) -> &mut Self {
        self.device = Some(driver);
        self
    }

    /// Creates the configured [`Scheduler`]. Workers spawn on
    /// [`schedule`](Scheduler::schedule).
    ///
    /// When no worker count was set and the host's parallelism cannot be
    /// queried, this falls back to a single worker; use
    /// [`try_build`](Builder::try_build) to surface that failure instead.
    pub fn build(&mut self) -> Scheduler {
        let worker_threads = self.worker_threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZero::get)
                .unwrap_or(1)
        });

        self.into_scheduler(worker_threads)
    }

    /// Creates the configured [`Scheduler`], consuming the builder.
    ///
    /// Fails if no worker count was set and the host's available
    /// parallelism cannot be queried.
    pub fn try_build(mut self) -> Result<Scheduler> {
        let worker_threads = match self.worker_threads {
            Some(val) => val,
            None => thread::available_parallelism()
                .context("failed to query available parallelism")?
                .get(),
        };

        Ok(self.into_scheduler(worker_threads))
    }

    fn into_scheduler(&mut self, worker_threads: usize) -> Scheduler {
        let cfg = RuntimeConfig {
            worker_threads,
            num_streams: self.num_streams,
            thread_name: self.thread_name.clone(),
            thread_stack_size: self.thread_stack_size,
        };
        let driver = self
            .device
            .take()
            .unwrap_or_else(|| Arc::new(SimDriver::new()));

        Scheduler::from_parts(cfg, driver)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

use crate::device::{DeviceDriver, DeviceError, HostCallback, Kernel, Stream};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

enum StreamOp {
    Kernel(Kernel),
    Callback(HostCallback),
}

/// One executor thread per stream. Dropping the sender ends the thread.
struct StreamLane {
    ops: mpsc::Sender<StreamOp>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Software implementation of the device facade.
///
/// Each stream is backed by a dedicated FIFO executor thread, so kernels on
/// one stream run in submission order and host callbacks run on a
/// driver-owned thread after all prior work on that stream, which is the
/// observable contract of `cudaLaunchHostFunc` on a non-blocking stream.
///
/// `kernel_latency` injects a fixed delay in front of every kernel, which
/// is how tests keep many callbacks in flight at once.
pub struct SimDriver {
    lanes: DashMap<u64, StreamLane>,
    next_id: AtomicU64,
    kernel_latency: Option<Duration>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl SimDriver {
    pub fn new() -> Self {
        Self {
            lanes: DashMap::new(),
            next_id: AtomicU64::new(0),
            kernel_latency: None,
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    pub fn with_kernel_latency(latency: Duration) -> Self {
        let mut driver = Self::new();
        driver.kernel_latency = Some(latency);
        driver
    }

    /// Streams created over the driver's lifetime. Monotone.
    pub fn streams_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn streams_destroyed(&self) -> usize {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn live_streams(&self) -> usize {
        self.lanes.len()
    }

    fn submit(&self, stream: &Stream, op: StreamOp) -> Result<(), DeviceError> {
        let lane = self
            .lanes
            .get(&stream.raw())
            .ok_or(DeviceError::StreamGone(*stream))?;

        lane.ops.send(op).map_err(|_| DeviceError::ShuttingDown)
    }

    fn join_lane(id: u64, mut lane: StreamLane) {
        // Dropping the sender lets the executor drain its queue and exit.
        drop(lane.ops);
        if let Some(thread) = lane.thread.take()
            && thread.join().is_err()
        {
            tracing::error!(stream = id, "stream executor thread panicked");
        }
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for SimDriver {
    fn stream_create(&self) -> Result<Stream, DeviceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (ops, rx) = mpsc::channel::<StreamOp>();
        let latency = self.kernel_latency;

        let thread = thread::Builder::new()
            .name(format!("strand-stream-{id}"))
            .spawn(move || {
                while let Ok(op) = rx.recv() {
                    match op {
                        StreamOp::Kernel(kernel) => {
                            if let Some(latency) = latency {
                                thread::sleep(latency);
                            }
                            kernel.run();
                        }
                        StreamOp::Callback(callback) => callback(),
                    }
                }
            })
            .map_err(|e| DeviceError::Other(e.into()))?;

        self.lanes.insert(
            id,
            StreamLane {
                ops,
                thread: Some(thread),
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(stream = id, "created device stream");

        Ok(Stream::from_raw(id))
    }

    fn stream_destroy(&self, stream: Stream) -> Result<(), DeviceError> {
        let (id, lane) = self
            .lanes
            .remove(&stream.raw())
            .ok_or(DeviceError::StreamGone(stream))?;

        Self::join_lane(id, lane);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(stream = id, "destroyed device stream");

        Ok(())
    }

    fn launch_kernel(&self, kernel: Kernel, stream: &Stream) -> Result<(), DeviceError> {
        self.submit(stream, StreamOp::Kernel(kernel))
    }

    fn launch_host_callback(
        &self,
        stream: &Stream,
        callback: HostCallback,
    ) -> Result<(), DeviceError> {
        self.submit(stream, StreamOp::Callback(callback))
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        // Streams that were never handed back (e.g. stranded by an aborted
        // run) are destroyed here.
        let ids: Vec<u64> = self.lanes.iter().map(|lane| *lane.key()).collect();
        for id in ids {
            if let Some((id, lane)) = self.lanes.remove(&id) {
                Self::join_lane(id, lane);
                self.destroyed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

//! Minimal facade over a CUDA-like device runtime.
//!
//! The scheduler only needs two capabilities from the device: enqueue a
//! kernel on a stream, and run a host callback on a runtime-owned thread
//! once all prior work on that stream has drained. Everything else (kernel
//! compilation, memory transfers, device management) stays behind the
//! [`DeviceDriver`] implementation.

use std::fmt;

mod sim;
pub use sim::SimDriver;

/// An opaque device-stream handle.
///
/// Streams are minted by a [`DeviceDriver`] and recycled through per-worker
/// pools; the handle itself is a plain dense id, cheap to move between
/// pools and in-flight suspension records.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Stream(u64);

impl Stream {
    /// Wraps a raw driver-assigned stream id.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// An opaque unit of device work, submitted to a stream without blocking.
pub struct Kernel(Box<dyn FnOnce() + Send + 'static>);

impl Kernel {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(work))
    }

    /// A kernel that does nothing. Still round-trips through the stream.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Consumes the kernel and runs its work. Called by driver
    /// implementations on whatever executes the stream.
    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Kernel").field(&"<work>").finish()
    }
}

/// A host function invoked on a driver-owned thread once a stream drains.
pub type HostCallback = Box<dyn FnOnce() + Send + 'static>;

/// Errors reported by the device runtime.
///
/// All of these are fatal to the scheduler run that triggered them; they
/// surface as [`SchedulerError::DeviceSubmit`](crate::SchedulerError).
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    /// The stream handle does not (or no longer does) name a live stream.
    #[error("unknown or destroyed stream: {0}")]
    StreamGone(Stream),

    /// The driver is tearing down and refuses new submissions.
    #[error("device runtime is shutting down")]
    ShuttingDown,

    /// A catch-all for any other type of unexpected driver error.
    #[error("unexpected device error: {0}")]
    Other(#[from] anyhow::Error),
}

/// The device-runtime surface the scheduler consumes.
///
/// Contract, mirroring the CUDA host API the facade abstracts:
/// - `launch_kernel` is a non-blocking submit; work on one stream executes
///   in submission order.
/// - `launch_host_callback` invokes the callback on a thread owned by the
///   driver after all previously submitted work on `stream` has completed.
///   The callback must not assume it runs on a scheduler worker.
pub trait DeviceDriver: Send + Sync + 'static {
    fn stream_create(&self) -> Result<Stream, DeviceError>;

    fn stream_destroy(&self, stream: Stream) -> Result<(), DeviceError>;

    fn launch_kernel(&self, kernel: Kernel, stream: &Stream) -> Result<(), DeviceError>;

    fn launch_host_callback(
        &self,
        stream: &Stream,
        callback: HostCallback,
    ) -> Result<(), DeviceError>;
}

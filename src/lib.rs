//! Task-DAG scheduler for heterogeneous CPU/GPU workloads.
//!
//! Every GPU-bound computation is a *suspendable* task: when it reaches a
//! device wait point it yields its worker instead of blocking on the
//! stream, and the worker goes on executing other CPU or GPU-dispatching
//! tasks. When the device signals completion through a host callback, the
//! suspended task is re-queued and resumed by whichever worker picks it up.
//!
//! Workers run a work-stealing loop over per-worker deques with a
//! two-phase-commit idle protocol, and recycle device streams through
//! per-worker stealable pools.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use strand::{Kernel, Scheduler, Yield};
//!
//! let mut scheduler = Scheduler::new(2, 0);
//! let hits = Arc::new(AtomicUsize::new(0));
//!
//! let h = Arc::clone(&hits);
//! let load = scheduler.emplace_static(move || {
//!     h.fetch_add(1, Ordering::Relaxed);
//! });
//!
//! // Suspends while its kernel is in flight, then completes.
//! let h = Arc::clone(&hits);
//! let mut launched = false;
//! let infer = scheduler.emplace_suspendable(move || {
//!     if !launched {
//!         launched = true;
//!         let h = Arc::clone(&h);
//!         Yield::Device(Kernel::new(move || {
//!             h.fetch_add(1, Ordering::Relaxed);
//!         }))
//!     } else {
//!         Yield::Done
//!     }
//! });
//!
//! scheduler.precede(load, infer);
//! assert!(scheduler.is_dag());
//! scheduler.schedule().unwrap();
//! scheduler.wait().unwrap();
//! assert_eq!(hits.load(Ordering::Relaxed), 2);
//! ```

pub mod device;

mod error;
mod runtime;
mod task;

pub use device::{DeviceDriver, DeviceError, HostCallback, Kernel, SimDriver, Stream};
pub use error::SchedulerError;
pub use runtime::{Builder, Scheduler};
pub use task::{Suspendable, TaskHandle, TaskId, Yield};

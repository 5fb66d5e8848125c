use crate::device::{DeviceDriver, DeviceError, HostCallback, Kernel, SimDriver, Stream};
use crate::error::SchedulerError;
use crate::runtime::{Builder, Scheduler};
use crate::task::Yield;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

assert_impl_all!(Scheduler: Send, Sync);
assert_impl_all!(Builder: Send);

/// Wraps a driver and tracks how many host callbacks are registered but
/// not yet fully returned, plus the high-water mark.
struct CountingDriver {
    inner: Arc<SimDriver>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl CountingDriver {
    fn new(inner: Arc<SimDriver>) -> Self {
        Self {
            inner,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl DeviceDriver for CountingDriver {
    fn stream_create(&self) -> Result<Stream, DeviceError> {
        self.inner.stream_create()
    }

    fn stream_destroy(&self, stream: Stream) -> Result<(), DeviceError> {
        self.inner.stream_destroy(stream)
    }

    fn launch_kernel(&self, kernel: Kernel, stream: &Stream) -> Result<(), DeviceError> {
        self.inner.launch_kernel(kernel, stream)
    }

    fn launch_host_callback(
        &self,
        stream: &Stream,
        callback: HostCallback,
    ) -> Result<(), DeviceError> {
        let in_flight = Arc::clone(&self.in_flight);
        let peak = Arc::clone(&self.peak);

        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);

        self.inner.launch_host_callback(
            stream,
            Box::new(move || {
                callback();
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }),
        )
    }
}

/// A driver that accepts streams but rejects every kernel submission.
struct RejectingDriver;

impl DeviceDriver for RejectingDriver {
    fn stream_create(&self) -> Result<Stream, DeviceError> {
        Ok(Stream::from_raw(0))
    }

    fn stream_destroy(&self, _stream: Stream) -> Result<(), DeviceError> {
        Ok(())
    }

    fn launch_kernel(&self, _kernel: Kernel, _stream: &Stream) -> Result<(), DeviceError> {
        Err(DeviceError::ShuttingDown)
    }

    fn launch_host_callback(
        &self,
        _stream: &Stream,
        _callback: HostCallback,
    ) -> Result<(), DeviceError> {
        Err(DeviceError::ShuttingDown)
    }
}

/// A suspendable body that device-suspends `suspensions` times on no-op
/// kernels, then completes.
fn device_hopper(suspensions: usize) -> impl FnMut() -> Yield + Send + 'static {
    let mut remaining = suspensions;
    move || {
        if remaining > 0 {
            remaining -= 1;
            Yield::Device(Kernel::noop())
        } else {
            Yield::Done
        }
    }
}

#[rstest]
#[case::one_worker(1)]
#[case::two_workers(2)]
#[case::four_workers(4)]
fn test_linear_chain_of_static_tasks(#[case] workers: usize) {
    let mut scheduler = Scheduler::new(workers, 0);
    let log = Arc::new(Mutex::new(String::new()));

    let handles: Vec<_> = ["A", "B", "C", "D", "E"]
        .into_iter()
        .map(|letter| {
            let log = Arc::clone(&log);
            scheduler.emplace_static(move || log.lock().push_str(letter))
        })
        .collect();
    for pair in handles.windows(2) {
        scheduler.precede(pair[0], pair[1]);
    }

    scheduler.schedule().unwrap();
    scheduler.wait().unwrap();

    assert_eq!(*log.lock(), "ABCDE");
    assert_eq!(scheduler.core().finished_count(), 5);
}

#[test]
fn test_diamond_runs_both_branches_before_sink() {
    for _ in 0..1000 {
        let mut scheduler = Scheduler::new(2, 0);
        let x = Arc::new(AtomicUsize::new(0));
        let y = Arc::new(AtomicUsize::new(0));

        let a = scheduler.emplace_static(|| {});
        let b = {
            let x = Arc::clone(&x);
            scheduler.emplace_static(move || {
                x.fetch_add(1, Ordering::Relaxed);
            })
        };
        let c = {
            let y = Arc::clone(&y);
            scheduler.emplace_static(move || {
                y.fetch_add(1, Ordering::Relaxed);
            })
        };
        let d = {
            let x = Arc::clone(&x);
            let y = Arc::clone(&y);
            scheduler.emplace_static(move || {
                assert_eq!(x.load(Ordering::Relaxed), 1);
                assert_eq!(y.load(Ordering::Relaxed), 1);
            })
        };

        scheduler.precede(a, b);
        scheduler.precede(a, c);
        scheduler.precede(b, d);
        scheduler.precede(c, d);

        scheduler.schedule().unwrap();
        scheduler.wait().unwrap();
    }
}

#[test]
fn test_plain_suspend_resumes_in_order() {
    let mut scheduler = Scheduler::new(2, 0);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let resumes = Arc::new(AtomicUsize::new(0));

    let observed_body = Arc::clone(&observed);
    let resumes_body = Arc::clone(&resumes);
    let mut step = 0_usize;
    scheduler.emplace_suspendable(move || {
        resumes_body.fetch_add(1, Ordering::Relaxed);
        observed_body.lock().push(step);
        step += 1;
        if step <= 3 { Yield::Suspend } else { Yield::Done }
    });

    scheduler.schedule().unwrap();
    scheduler.wait().unwrap();

    assert_eq!(*observed.lock(), vec![0, 1, 2, 3]);
    // One resume round-trip per yield, plus the initial one.
    assert_eq!(resumes.load(Ordering::Relaxed), 4);
    assert_eq!(scheduler.core().finished_count(), 1);
}

#[test]
fn test_device_suspend_fan_out_peaks_and_drains() {
    let sim = Arc::new(SimDriver::with_kernel_latency(Duration::from_millis(250)));
    let driver = Arc::new(CountingDriver::new(Arc::clone(&sim)));
    let in_flight = Arc::clone(&driver.in_flight);
    let peak = Arc::clone(&driver.peak);

    let mut scheduler = Builder::new().worker_threads(4).device(driver).build();

    let source = scheduler.emplace_static(|| {});
    for _ in 0..16 {
        let child = scheduler.emplace_suspendable(device_hopper(1));
        scheduler.precede(source, child);
    }

    scheduler.schedule().unwrap();
    scheduler.wait().unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 16);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.core().finished_count(), 17);
    assert_eq!(scheduler.core().outstanding_callbacks(), 0);

    // Every stream handed out came back and died with its worker.
    drop(scheduler);
    assert_eq!(sim.streams_created(), sim.streams_destroyed());
}

#[test]
fn test_cycle_is_rejected() {
    let mut scheduler = Scheduler::new(1, 0);
    let a = scheduler.emplace_static(|| {});
    let b = scheduler.emplace_static(|| {});
    scheduler.precede(a, b);
    scheduler.precede(b, a);

    assert!(!scheduler.is_dag());
    assert!(matches!(
        scheduler.schedule(),
        Err(SchedulerError::GraphCycle)
    ));
}

#[test]
fn test_fast_callback_cannot_overlap_resumes() {
    let mut scheduler = Scheduler::new(4, 0);
    let overlaps = Arc::new(AtomicUsize::new(0));

    // No kernel latency: callbacks race the yielding resume as hard as the
    // sim driver allows.
    for _ in 0..8 {
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::clone(&overlaps);
        let mut hops = device_hopper(25);
        scheduler.emplace_suspendable(move || {
            if active.fetch_add(1, Ordering::SeqCst) != 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            let step = hops();
            active.fetch_sub(1, Ordering::SeqCst);
            step
        });
    }

    scheduler.schedule().unwrap();
    scheduler.wait().unwrap();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.core().finished_count(), 8);
    assert_eq!(scheduler.core().outstanding_callbacks(), 0);
}

#[test]
fn test_single_worker_reuses_its_pooled_stream() {
    let sim = Arc::new(SimDriver::new());
    let mut scheduler = Builder::new()
        .worker_threads(1)
        .device(Arc::clone(&sim) as Arc<dyn DeviceDriver>)
        .build();

    scheduler.emplace_suspendable(device_hopper(5));

    scheduler.schedule().unwrap();
    scheduler.wait().unwrap();

    // Each suspension returns the stream to the only worker's pool before
    // the next one acquires it.
    assert_eq!(sim.streams_created(), 1);
}

#[rstest]
#[case::two_workers(2)]
#[case::four_workers(4)]
fn test_mixed_chain_tail_chains_through_suspendables(#[case] workers: usize) {
    let mut scheduler = Scheduler::new(workers, 0);
    let log = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let log = Arc::clone(&log);
        scheduler.emplace_static(move || log.lock().push("static-head"))
    };
    let middle = {
        let log = Arc::clone(&log);
        let mut yielded = false;
        scheduler.emplace_suspendable(move || {
            if !yielded {
                yielded = true;
                log.lock().push("suspend");
                Yield::Suspend
            } else {
                log.lock().push("resume");
                Yield::Done
            }
        })
    };
    let last = {
        let log = Arc::clone(&log);
        scheduler.emplace_static(move || log.lock().push("static-tail"))
    };

    scheduler.precede(first, middle);
    scheduler.succeed(last, middle);

    scheduler.schedule().unwrap();
    scheduler.wait().unwrap();

    assert_eq!(
        *log.lock(),
        vec!["static-head", "suspend", "resume", "static-tail"]
    );
}

#[test]
fn test_wide_fan_out_and_fan_in() {
    let mut scheduler = Scheduler::new(4, 0);
    let hits = Arc::new(AtomicUsize::new(0));

    let source = scheduler.emplace_static(|| {});
    let sink = {
        let hits = Arc::clone(&hits);
        scheduler.emplace_static(move || {
            assert_eq!(hits.load(Ordering::SeqCst), 32);
        })
    };
    for _ in 0..32 {
        let hits = Arc::clone(&hits);
        let mid = scheduler.emplace_static(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.precede(source, mid);
        scheduler.precede(mid, sink);
    }

    scheduler.schedule().unwrap();
    scheduler.wait().unwrap();
    assert_eq!(scheduler.core().finished_count(), 34);
}

#[test]
fn test_static_body_panic_surfaces_in_wait() {
    let mut scheduler = Scheduler::new(2, 0);
    scheduler.emplace_static(|| panic!("boom"));

    scheduler.schedule().unwrap();
    let err = scheduler.wait().unwrap_err();
    assert!(matches!(&err, SchedulerError::BodyPanic(msg) if msg.contains("boom")));
}

#[test]
fn test_suspendable_body_panic_surfaces_in_wait() {
    let mut scheduler = Scheduler::new(2, 0);
    let mut yielded = false;
    scheduler.emplace_suspendable(move || {
        if !yielded {
            yielded = true;
            Yield::Suspend
        } else {
            panic!("late boom")
        }
    });

    scheduler.schedule().unwrap();
    let err = scheduler.wait().unwrap_err();
    assert!(matches!(&err, SchedulerError::BodyPanic(msg) if msg.contains("late boom")));
}

#[test]
fn test_device_submit_failure_aborts_the_run() {
    let mut builder = Builder::new();
    builder.worker_threads(2).device(Arc::new(RejectingDriver));
    let mut scheduler = builder.try_build().unwrap();

    scheduler.emplace_suspendable(device_hopper(1));

    scheduler.schedule().unwrap();
    let err = scheduler.wait().unwrap_err();
    assert!(matches!(err, SchedulerError::DeviceSubmit(_)));
}

#[test]
fn test_schedule_twice_is_rejected() {
    let mut scheduler = Scheduler::new(1, 0);
    scheduler.emplace_static(|| {});

    scheduler.schedule().unwrap();
    assert!(matches!(
        scheduler.schedule(),
        Err(SchedulerError::AlreadyScheduled)
    ));
    scheduler.wait().unwrap();
}

#[test]
fn test_empty_graph_terminates() {
    let mut scheduler = Scheduler::new(2, 0);
    assert!(scheduler.is_dag());
    scheduler.schedule().unwrap();
    scheduler.wait().unwrap();
    assert_eq!(scheduler.core().finished_count(), 0);
}

#[test]
fn test_num_streams_is_advisory() {
    // Streams are lazily created; the hint changes nothing observable.
    let mut scheduler = Scheduler::new(2, 64);
    let ran = Arc::new(AtomicUsize::new(0));

    let ran_body = Arc::clone(&ran);
    scheduler.emplace_static(move || {
        ran_body.fetch_add(1, Ordering::Relaxed);
    });

    scheduler.schedule().unwrap();
    scheduler.wait().unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 1);
}

#[test]
fn test_drop_without_wait_shuts_down() {
    let mut scheduler = Scheduler::new(2, 0);
    let mut hops = device_hopper(3);
    scheduler.emplace_suspendable(move || hops());
    scheduler.schedule().unwrap();
    // Drop joins workers and drains outstanding callbacks.
    drop(scheduler);
}

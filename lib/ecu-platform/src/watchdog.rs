//! Timeout supervisor (`§4.1`, `§5`, `§6`): "the watchdog monitor thread
//! blocks on a condition variable with a timeout equal to its configured
//! interval." A missed pat within the armed timeout calls the platform
//! reset path.
//!
//! Grounded on the original pthread `Watchdog` struct, translated onto
//! `std::sync::{Mutex, Condvar}`. The actual reset action is abstracted
//! behind [`ResetSink`] so it can be driven through a recording fake on the
//! host rather than calling `std::process::exit` in every test.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// The platform action taken when a pat is missed. A real embedding's
/// implementation reboots the MCU; the host implementation below just exits
/// the process, matching the original's `abort()`.
pub trait ResetSink: Send + Sync {
    fn reset_platform(&self);
}

pub struct ProcessExitResetSink;

impl ResetSink for ProcessExitResetSink {
    fn reset_platform(&self) {
        std::process::exit(111);
    }
}

/// Records that a reset was requested instead of actually terminating the
/// process. Used by tests and by any embedding that wants to intercept the
/// reset (e.g. to log first).
#[derive(Default)]
pub struct RecordingResetSink {
    pub triggered: AtomicBool,
}

impl ResetSink for RecordingResetSink {
    fn reset_platform(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }
}

struct Inner {
    timeout_ms: Mutex<u64>,
    patted: Mutex<bool>,
    cond: Condvar,
    running: AtomicBool,
    sink: Arc<dyn ResetSink>,
}

/// A condvar-driven watchdog supervisor. `pat()` is called by the scheduler
/// once per task activation, immediately before the task body runs
/// (`§4.1`).
pub struct Watchdog {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(timeout_ms: u64, sink: Arc<dyn ResetSink>) -> Self {
        Watchdog {
            inner: Arc::new(Inner {
                timeout_ms: Mutex::new(timeout_ms),
                patted: Mutex::new(false),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                sink,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Reconfigures the timeout for the next wait cycle.
    pub fn arm(&self, timeout_ms: u64) {
        *self.inner.timeout_ms.lock().unwrap() = timeout_ms;
    }

    /// Records that the watchdog was serviced, waking the monitor thread.
    pub fn pat(&self) {
        let mut patted = self.inner.patted.lock().unwrap();
        *patted = true;
        self.inner.cond.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Starts the monitor thread. No-op if already running.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("ecu-watchdog".into())
            .spawn(move || watchdog_loop(inner))
            .expect("failed to spawn watchdog monitor thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Stops the monitor thread and joins it.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cond.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn watchdog_loop(inner: Arc<Inner>) {
    while inner.running.load(Ordering::SeqCst) {
        let timeout = Duration::from_millis(*inner.timeout_ms.lock().unwrap());
        let patted = inner.patted.lock().unwrap();
        let (mut patted, result) = inner.cond.wait_timeout(patted, timeout).unwrap();
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        if result.timed_out() && !*patted {
            inner.sink.reset_platform();
            return;
        }
        *patted = false;
    }
}

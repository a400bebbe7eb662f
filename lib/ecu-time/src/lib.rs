//! The runtime's single time source, injected into every component at
//! construction instead of read from a process-wide singleton (`§9` design
//! notes: "treat the time source as a trait/interface injected into each
//! component").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic clock contract required by every component (`§6`).
///
/// Implementations must never report a decreasing value across calls.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    fn now_us(&self) -> u64;
    fn sleep_until_us(&self, deadline_us: u64);
}

/// Real monotonic clock backed by [`std::time::Instant`].
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn sleep_until_us(&self, deadline_us: u64) {
        let now = self.now_us();
        if deadline_us > now {
            std::thread::sleep(Duration::from_micros(deadline_us - now));
        }
    }
}

/// A host-testable fake clock. `advance`/`set` are called by the test; no
/// component ever sleeps against it for real (`sleep_until_us` returns
/// immediately once the requested deadline has been "reached" by the test
/// driver advancing the clock).
#[derive(Clone)]
pub struct FakeClock {
    now_us: Arc<AtomicU64>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            now_us: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_us(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    pub fn advance_us(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.advance_us(delta_ms * 1000);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }

    fn sleep_until_us(&self, _deadline_us: u64) {
        // Tests drive time explicitly; there is nothing to block on.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_never_goes_backwards() {
        let clock = FakeClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance_ms(10);
        assert_eq!(clock.now_ms(), 10);
        clock.advance_ms(5);
        assert_eq!(clock.now_ms(), 15);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_us();
        std::thread::sleep(Duration::from_millis(1));
        let b = clock.now_us();
        assert!(b >= a);
    }
}

//! Sleep abstraction for testable waits.
//!
//! The piped exporter sleeps while waiting for a child to exit after SIGTERM. The
//! mock sleeper returns immediately and can move a `MockClock` forward by the
//! requested amount, so kill escalation runs in virtual time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit_clock::MockClock;

/// Trait for sleeping between polls.
pub trait Sleeper: Send + Sync {
    /// Sleep for the specified number of milliseconds.
    fn sleep_ms(&self, millis: u64);
}

impl<S: Sleeper + ?Sized> Sleeper for Arc<S> {
    fn sleep_ms(&self, millis: u64) {
        (**self).sleep_ms(millis);
    }
}

/// Real sleeper that uses `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSleeper;

impl RealSleeper {
    pub fn new() -> Self {
        Self
    }
}

impl Sleeper for RealSleeper {
    fn sleep_ms(&self, millis: u64) {
        std::thread::sleep(Duration::from_millis(millis));
    }
}

/// Mock sleeper for testing - returns immediately.
#[derive(Debug, Default, Clone)]
pub struct MockSleeper {
    clock: Option<MockClock>,
    slept_ms: Arc<AtomicU64>,
}

impl MockSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance `clock` by every requested sleep.
    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            clock: Some(clock),
            slept_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total milliseconds requested so far.
    pub fn slept_ms(&self) -> u64 {
        self.slept_ms.load(Ordering::SeqCst)
    }
}

impl Sleeper for MockSleeper {
    fn sleep_ms(&self, millis: u64) {
        self.slept_ms.fetch_add(millis, Ordering::SeqCst);
        if let Some(clock) = &self.clock {
            clock.advance_ms(millis);
        }
    }
}

//! Clock abstraction for conduit.
//!
//! Provides a trait for getting the current time, with both real and mock implementations
//! so batching deadlines and kill escalation can be tested deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Trait for getting the current Unix time.
pub trait Clock: Send + Sync {
    /// Returns the current time as Unix milliseconds since epoch.
    fn now_unix_ms(&self) -> u64;

    /// Returns the current time as Unix seconds since epoch.
    fn now_unix_sec(&self) -> u64 {
        self.now_unix_ms() / 1000
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_unix_ms(&self) -> u64 {
        (**self).now_unix_ms()
    }
}

/// Real system clock implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        // A clock set before the epoch reads as zero rather than panicking.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Mock clock for testing.
///
/// Clones share the same underlying time, so a test can hold one handle and move
/// another into the component under test.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now_ms: Arc<AtomicU64>,
}

impl MockClock {
    /// Create a mock clock fixed at `now_ms` milliseconds.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    /// Create a mock clock fixed at `secs` seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self::new(secs * 1000)
    }

    /// Set the current time.
    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Move the current time forward.
    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_unix_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Mock clock that auto-advances time on each call.
///
/// Useful for testing polling loops where the clock needs to progress.
#[derive(Debug)]
pub struct AdvancingClock {
    now_ms: AtomicU64,
    increment_ms: u64,
}

impl AdvancingClock {
    /// Create an advancing clock starting at `now_ms` and incrementing by `increment_ms` each call.
    pub fn new(now_ms: u64, increment_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
            increment_ms,
        }
    }
}

impl Clock for AdvancingClock {
    fn now_unix_ms(&self) -> u64 {
        self.now_ms.fetch_add(self.increment_ms, Ordering::SeqCst)
    }
}

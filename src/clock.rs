//! Injectable time source.
//!
//! Every time read inside the scheduler and the queue-length cache goes
//! through a [`Clock`] so that staleness, FIFO ordering, and deadline
//! backoff are deterministic under test. Production code uses
//! [`SystemClock`]; tests use [`MockClock`] and advance it manually.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds as a float.
///
/// The one permitted direct wall-clock read in the crate; everything
/// downstream of construction uses an injected [`Clock`].
pub fn unix_time_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Provides the current time in seconds.
///
/// Injected into the scheduler and cache rather than reading the system
/// clock directly, which makes timing-sensitive behavior (cache
/// staleness, FIFO-by-creation, model-id match windows) testable without
/// real sleeps.
pub trait Clock: Send + Sync {
    /// Returns the current time in seconds.
    ///
    /// Only differences between readings are meaningful; implementations
    /// may use any fixed epoch.
    fn now(&self) -> f64;
}

/// The default [`Clock`] backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        unix_time_s()
    }
}

/// A manually-advanced clock for deterministic tests.
///
/// Cloning a `MockClock` shares the underlying time, so a clone handed
/// to the scheduler stays in sync with the copy the test advances.
///
/// # Examples
/// ```
/// use replica_router::{Clock, MockClock};
///
/// let clock = MockClock::new(100.0);
/// clock.advance(5.0);
/// assert_eq!(clock.now(), 105.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now_bits: Arc<AtomicU64>,
}

impl MockClock {
    /// Create a mock clock starting at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            now_bits: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    /// Advance the clock by `delta` seconds.
    pub fn advance(&self, delta: f64) {
        let current = f64::from_bits(self.now_bits.load(Ordering::Acquire));
        self.set(current + delta);
    }

    /// Jump the clock to an absolute reading.
    pub fn set(&self, now: f64) {
        self.now_bits.store(now.to_bits(), Ordering::Release);
    }
}

impl Clock for MockClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.now_bits.load(Ordering::Acquire))
    }
}

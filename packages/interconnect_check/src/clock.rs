use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of the timestamps that bracket a sample.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Debug + Send + Sync {
    /// The current point in time.
    fn now(&self) -> Instant;
}

/// The monotonic clock of the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealClock;

impl Clock for RealClock {
    #[cfg_attr(test, mutants::skip)] // Real time cannot be asserted on.
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a workload can advance the clock that the collector reads to
/// simulate operations that take a precise amount of time.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use interconnect_check::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let start = clock.now();
///
/// clock.advance(Duration::from_micros(50));
///
/// assert_eq!(clock.now() - start, Duration::from_micros(50));
/// ```
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Moves the clock forward.
    ///
    /// # Panics
    ///
    /// Panics if the total offset overflows `Duration`.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock();
        *offset = offset
            .checked_add(by)
            .expect("a manual clock cannot realistically advance past Duration::MAX");
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin
            .checked_add(*self.offset.lock())
            .expect("a manual clock never advances beyond what Instant can represent")
    }
}

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing the interconnect benchmark packages.

use std::env;
use std::panic;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// Runs a test body on a separate thread and fails the test if it does not finish in time.
///
/// Collective operations that are called in the wrong order or by the wrong number of
/// participants block forever, so every test that involves more than one context runs under a
/// watchdog. The timeout is 10 seconds, or 60 seconds under Miri.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the body runs directly on the
/// calling thread so that mutation testing can observe hangs itself.
///
/// # Panics
///
/// Panics if the body exceeds the timeout. Panics raised by the body are propagated.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let sum = with_watchdog(|| 2 + 2);
/// assert_eq!(sum, 4);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        // The receiver is gone if we already timed out.
        drop(tx.send(test_fn()));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("test thread already delivered its result");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded {timeout:?} timeout, probably a collective operation deadlock");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected without delivering a result"),
            Err(e) => panic::resume_unwind(e),
        },
    }
}

/// Returns the absolute difference between `a` and `b`, or zero if the difference is not more
/// than `close_enough`.
#[must_use]
pub fn f64_diff_abs(a: f64, b: f64, close_enough: f64) -> f64 {
    let diff = (a - b).abs();

    if diff <= close_enough { 0.0 } else { diff }
}

/// Records which contexts are active at the same time.
///
/// Clone the probe into every context and wrap the work that must be exclusive in
/// [`enter()`][Self::enter]. Afterwards, [`max_concurrency()`][Self::max_concurrency] tells
/// whether any two contexts ever overlapped and [`visits()`][Self::visits] lists the order in
/// which contexts entered.
///
/// # Example
///
/// ```rust
/// use testing::ExclusivityProbe;
///
/// let probe = ExclusivityProbe::new();
///
/// {
///     let _active = probe.enter(0);
/// }
/// {
///     let _active = probe.enter(1);
/// }
///
/// assert_eq!(probe.max_concurrency(), 1);
/// assert_eq!(probe.visits(), vec![0, 1]);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ExclusivityProbe {
    state: Arc<Mutex<ProbeState>>,
}

#[derive(Debug, Default)]
struct ProbeState {
    active: usize,
    max_active: usize,
    visits: Vec<usize>,
}

impl ExclusivityProbe {
    /// Creates a probe that has seen no activity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks context `ordinal` as active until the returned guard is dropped.
    #[must_use]
    pub fn enter(&self, ordinal: usize) -> ProbeGuard {
        let mut state = self.state.lock();

        state.active = state
            .active
            .checked_add(1)
            .expect("active count cannot realistically overflow");
        state.max_active = state.max_active.max(state.active);
        state.visits.push(ordinal);

        ProbeGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// The largest number of contexts that were active at the same time.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.state.lock().max_active
    }

    /// The ordinals of the contexts in the order they entered.
    #[must_use]
    pub fn visits(&self) -> Vec<usize> {
        self.state.lock().visits.clone()
    }
}

/// Keeps a context marked as active in an [`ExclusivityProbe`].
#[derive(Debug)]
pub struct ProbeGuard {
    state: Arc<Mutex<ProbeState>>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.active = state
            .active
            .checked_sub(1)
            .expect("every guard was counted when it was created");
    }
}

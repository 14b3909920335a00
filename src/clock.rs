//! A time interface that can be replaced by a fake implementation during
//! testing.
//!
//! Cache validity, sample ageing and validation backoff all measure
//! elapsed time. Tests inject [`MockClock`] to advance time without
//! sleeping.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

//------------ Clock ---------------------------------------------------------

/// A source of monotonic instants.
pub trait Clock: Clone + Send + Sync + 'static {
    /// The instant type produced by this clock.
    type Instant: Clone + Debug + Elapsed + Send + Sync + 'static;

    /// Records the current time.
    fn now(&self) -> Self::Instant;
}

//------------ Elapsed -------------------------------------------------------

/// Reports the time that has passed since an instant was recorded.
pub trait Elapsed {
    /// Returns the elapsed time.
    fn elapsed(&self) -> Duration;
}

//------------ SystemClock ---------------------------------------------------

/// The [`Clock`] implementation backed by [`std::time::Instant`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant::now()
    }
}

impl Elapsed for Instant {
    fn elapsed(&self) -> Duration {
        Instant::elapsed(self)
    }
}

//------------ MockClock -----------------------------------------------------

/// A clock that only moves when told to.
///
/// Cloning shares the underlying time so that a test can hold one handle
/// while the code under test holds another.
#[derive(Clone, Debug, Default)]
pub struct MockClock {
    current: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Creates a new clock starting at zero.
    pub fn new() -> Self {
        Default::default()
    }

    /// Advances the clock by `amount`.
    pub fn advance(&self, amount: Duration) {
        *self.current.lock() += amount;
    }
}

impl Clock for MockClock {
    type Instant = MockInstant;

    fn now(&self) -> Self::Instant {
        MockInstant {
            at: *self.current.lock(),
            clock: MockClock {
                current: self.current.clone(),
            },
        }
    }
}

//------------ MockInstant ---------------------------------------------------

/// An instant recorded from a [`MockClock`].
#[derive(Clone, Debug)]
pub struct MockInstant {
    /// The clock value at recording time.
    at: Duration,

    /// The owning clock, consulted when measuring.
    clock: MockClock,
}

impl Elapsed for MockInstant {
    fn elapsed(&self) -> Duration {
        self.clock.current.lock().saturating_sub(self.at)
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances() {
        let clock = MockClock::new();
        let start = clock.now();
        assert_eq!(start.elapsed(), Duration::ZERO);
        clock.advance(Duration::from_secs(90));
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }
}

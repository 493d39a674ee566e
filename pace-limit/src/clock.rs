//! Time sources for the pacer and limiters.
//!
//! Every component reads time and blocks through a [`Clock`], so tests can
//! swap the monotonic clock for a [`FakeClock`] whose sleeps only move a
//! mocked timeline forward.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;
use quanta::Mock;

/// A monotonic time source with a blocking sleep.
pub trait Clock: Debug + Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Blocks the calling thread for `duration`.
    fn sleep(&self, duration: Duration);

    /// Blocks the calling thread until `deadline`. Returns at once if the
    /// deadline is not in the future.
    fn sleep_until(&self, deadline: Instant) {
        let now = self.now();
        if deadline > now {
            self.sleep(deadline.saturating_duration_since(now));
        }
    }
}

/// The default clock: TSC backed where available, sleeping with the OS
/// scheduler.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    inner: quanta::Clock,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            inner: quanta::Clock::new(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        self.inner.now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// A manually driven clock.
///
/// Time only moves through [`FakeClock::advance`] or a sleep, which advances
/// the shared timeline by the requested amount instead of blocking. Clones
/// share the same timeline.
#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: quanta::Clock,
    mock: Arc<Mock>,
}

impl FakeClock {
    pub fn new() -> Self {
        let (inner, mock) = quanta::Clock::mock();
        Self { inner, mock }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.mock.increment(by);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.inner.now()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }

    fn sleep_until(&self, deadline: Instant) {
        (**self).sleep_until(deadline)
    }
}

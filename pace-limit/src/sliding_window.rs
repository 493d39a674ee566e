use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Instant;
use tracing::debug;

use super::Reason;
use super::Strategy;
use crate::clock::Clock;
use crate::clock::MonotonicClock;

/// A Sliding Window Counter implementation.
///
/// It keeps hit counts for the current fixed window and the one before it.
/// The effective count is: (previous_count * fraction_of_window_left) + current_count.
///
/// The three counters change together, so they sit behind a single mutex.
#[derive(Debug)]
pub struct SlidingWindow<C = MonotonicClock> {
    max: usize,
    window: Duration,
    state: Mutex<WindowState>,
    clock: C,
}

#[derive(Debug, Default)]
struct WindowState {
    current: usize,
    previous: usize,
    /// End of the current window. Set by the first hit.
    expires: Option<Instant>,
}

impl SlidingWindow<MonotonicClock> {
    pub fn new(max: NonZeroUsize, window: Duration) -> Self {
        Self::with_clock(max, window, MonotonicClock::new())
    }
}

impl<C: Clock> SlidingWindow<C> {
    pub fn with_clock(max: NonZeroUsize, window: Duration, clock: C) -> Self {
        Self {
            max: max.get(),
            window,
            state: Mutex::new(WindowState::default()),
            clock,
        }
    }

    /// Records a hit if it fits under the limit. Rejected hits are not counted.
    pub fn limit(&self) -> bool {
        self.hit().is_ok()
    }

    fn hit(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expires = self.rotate(&mut state, now);

        let reset_in = expires.saturating_duration_since(now);
        let weight = reset_in.as_secs_f64() / self.window.as_secs_f64();
        let carried = (state.previous as f64 * weight).floor() as usize;

        if carried + state.current < self.max {
            state.current += 1;
            Ok(())
        } else {
            let retry_after = self.retry_after(&state, reset_in);
            debug!(current = state.current, carried, ?retry_after, "sliding window full");
            Err(retry_after)
        }
    }

    /// Moves to a new window if the current one is over and returns when the
    /// current window ends.
    fn rotate(&self, state: &mut WindowState, now: Instant) -> Instant {
        match state.expires {
            None => {
                let expires = now + self.window;
                state.expires = Some(expires);
                expires
            }
            Some(expires) if now >= expires => {
                let next = if now.duration_since(expires) >= self.window {
                    // Idle for more than a whole window: nothing carries over.
                    state.previous = 0;
                    now + self.window
                } else {
                    state.previous = state.current;
                    expires + self.window
                };
                state.current = 0;
                state.expires = Some(next);
                next
            }
            Some(expires) => expires,
        }
    }

    /// How long until the carried over share of the previous window has
    /// shrunk enough to admit one more hit.
    ///
    /// A hit fits once `previous * weight < max - current`, so the weight has
    /// to drop strictly below `(max - current) / previous`.
    fn retry_after(&self, state: &WindowState, reset_in: Duration) -> Duration {
        if state.current >= self.max || state.previous == 0 {
            return reset_in;
        }
        let threshold = (self.max - state.current) as f64 / state.previous as f64;
        reset_in.saturating_sub(self.window.mul_f64(threshold.min(1.0))) + Duration::from_nanos(1)
    }
}

impl<C: Clock> Strategy for SlidingWindow<C> {
    #[inline]
    fn process(&self) -> ControlFlow<Reason> {
        match self.hit() {
            Ok(()) => ControlFlow::Continue(()),
            Err(retry_after) => ControlFlow::Break(Reason::Overloaded { retry_after }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::Arc;
    use std::thread;

    fn fake_window(max: usize, window: Duration) -> (SlidingWindow<FakeClock>, FakeClock) {
        let clock = FakeClock::new();
        let rl = SlidingWindow::with_clock(NonZeroUsize::new(max).unwrap(), window, clock.clone());
        (rl, clock)
    }

    //
    // Ensure that blasting requests in means we enforce our limit
    //
    #[test]
    fn it_enforces_limits_within_a_window() {
        let (rl, _) = fake_window(100, Duration::from_millis(10));

        let count = (0..500).filter(|_| rl.limit()).count();
        assert_eq!(count, 100);
    }

    #[test]
    fn test_sliding_window_concurrency() {
        let capacity = 50;
        let (rl, _) = fake_window(capacity, Duration::from_secs(60));
        let rl = Arc::new(rl);

        let handles: Vec<_> = (0..capacity + 1)
            .map(|_| {
                let rl = Arc::clone(&rl);
                thread::spawn(move || rl.limit())
            })
            .collect();
        let success_count = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(
            success_count, capacity,
            "Sliding window should allow exactly capacity during burst"
        );
    }

    #[test]
    fn test_previous_window_carries_over() {
        let window = Duration::from_secs(3);
        let (rl, clock) = fake_window(10, window);

        let admitted = (0..20).filter(|_| rl.limit()).count();
        assert_eq!(admitted, 10);

        // Right at the rotation the previous window still weighs in fully.
        clock.advance(window);
        assert!(!rl.limit());

        // One more window on, the previous window was empty.
        clock.advance(window);
        assert!(rl.limit());
    }

    #[test]
    fn test_sliding_window_partial_recovery() {
        let window = Duration::from_millis(100);
        let (rl, clock) = fake_window(10, window);
        for _ in 0..10 {
            assert!(rl.limit());
        }

        // Halfway into the next window, half of the previous 10 still count.
        clock.advance(window + window / 2);
        let extra = (0..10).filter(|_| rl.limit()).count();
        assert_eq!(extra, 5);
    }

    #[test]
    fn test_sliding_window_long_idle() {
        let window = Duration::from_millis(10);
        let (rl, clock) = fake_window(10, window);
        for _ in 0..10 {
            rl.limit();
        }

        clock.advance(window * 10);
        let count = (0..20).filter(|_| rl.limit()).count();
        assert_eq!(count, 10, "Previous count should be cleared after long idle");
    }

    #[test]
    fn test_retry_hint() {
        let window = Duration::from_millis(100);
        let (rl, clock) = fake_window(2, window);

        assert!(rl.process().is_continue());
        assert!(rl.process().is_continue());
        clock.advance(Duration::from_millis(40));
        // The current window is full: come back when it ends.
        assert_eq!(
            rl.process(),
            ControlFlow::Break(Reason::Overloaded {
                retry_after: Duration::from_millis(60)
            })
        );

        // Next window: both previous hits carry over until the weight dips
        // below 1, which it does right away.
        clock.advance(Duration::from_millis(60));
        assert_eq!(
            rl.process(),
            ControlFlow::Break(Reason::Overloaded {
                retry_after: Duration::from_nanos(1)
            })
        );
        clock.advance(Duration::from_millis(1));
        assert!(rl.process().is_continue());
    }

    #[test]
    fn retry_hint_tracks_carried_over_weight() {
        let window = Duration::from_millis(100);
        let (rl, clock) = fake_window(2, window);
        assert!(rl.limit());
        assert!(rl.limit());

        clock.advance(window + Duration::from_millis(1));
        assert!(rl.limit());

        // current = 1, previous = 2: the next hit needs the weight under 1/2.
        let ControlFlow::Break(Reason::Overloaded { retry_after }) = rl.process() else {
            panic!("window should be full");
        };
        assert_eq!(retry_after, Duration::from_millis(49) + Duration::from_nanos(1));

        clock.advance(retry_after - Duration::from_nanos(2));
        assert!(!rl.limit(), "admitted before the hint");
        clock.advance(Duration::from_nanos(2));
        assert!(rl.limit(), "refused after the hint");
    }
}

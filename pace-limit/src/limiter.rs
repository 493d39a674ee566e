use std::ops::ControlFlow;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Instant;
use tracing::debug;

use crate::Reason;
use crate::Strategy;
use crate::clock::Clock;
use crate::clock::MonotonicClock;
use crate::error::ConfigError;

/// A refill rate, in tokens per second.
///
/// Conversions between elapsed time and tokens always go through
/// [`tokens_from_duration`](Limit::tokens_from_duration) and
/// [`duration_from_tokens`](Limit::duration_from_tokens), so both directions
/// agree.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Limit(f64);

impl Limit {
    pub fn new(per_second: f64) -> Result<Self, ConfigError> {
        if per_second.is_finite() && per_second > 0.0 {
            Ok(Self(per_second))
        } else {
            Err(ConfigError::InvalidLimit(per_second))
        }
    }

    /// One token per `interval`.
    pub fn every(interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval(interval));
        }
        Self::new(1.0 / interval.as_secs_f64())
    }

    pub fn per_second(&self) -> f64 {
        self.0
    }

    /// Tokens accrued over `duration`.
    pub fn tokens_from_duration(&self, duration: Duration) -> f64 {
        duration.as_secs_f64() * self.0
    }

    /// Time needed to accrue `tokens`. Saturates at [`Duration::MAX`].
    pub fn duration_from_tokens(&self, tokens: f64) -> Duration {
        Duration::try_from_secs_f64(tokens / self.0).unwrap_or(Duration::MAX)
    }
}

/// A token bucket that hands out reservations.
///
/// The bucket holds at most `bucket` tokens and refills at `limit` tokens per
/// second. A request for `n` tokens is granted if the tokens are there now
/// or, when the caller accepts waiting, will be there within the caller's
/// `max_future_reserve`. Granting debits the balance immediately, so the
/// balance goes negative while reservations are outstanding: later callers
/// queue behind that debt instead of racing for the same tokens.
///
/// All decisions funnel through [`reserve_n`](ReservationLimiter::reserve_n)
/// under one mutex. Nothing sleeps while holding it.
///
/// ```rust
/// use pace_limit::ReservationLimiter;
/// use pace_limit::clock::Clock;
/// use pace_limit::clock::FakeClock;
/// use std::time::Duration;
///
/// let clock = FakeClock::new();
/// let limiter = ReservationLimiter::new(10.0, 1).unwrap().with_clock(clock.clone());
///
/// let t0 = clock.now();
/// assert!(limiter.allow_n(t0, 1));
/// assert!(!limiter.allow_n(t0, 1));
/// assert!(limiter.allow_n(t0 + Duration::from_millis(100), 1));
/// ```
#[derive(Debug)]
pub struct ReservationLimiter<C = MonotonicClock> {
    limit: Limit,
    bucket: u32,
    state: Mutex<LimiterState>,
    clock: C,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LimiterState {
    /// Current balance. Negative while granted reservations are still in the
    /// future.
    tokens: f64,
    /// When `tokens` was last brought up to date. `None` before the first
    /// grant, which reads as a full bucket.
    last: Option<Instant>,
    /// When the latest granted reservation takes effect.
    last_event: Option<Instant>,
}

/// The outcome of [`ReservationLimiter::reserve_n`].
///
/// Detached from the limiter: holding on to it keeps nothing alive and
/// dropping it gives nothing back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    ok: bool,
    tokens: u32,
    time_to_act: Option<Instant>,
    wait: Duration,
    limit: Limit,
}

impl Reservation {
    /// Whether the tokens were granted.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// How many tokens were asked for.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// When the tokens are (or, for a rejected reservation, would have been)
    /// available. `None` if the request exceeds the bucket and can never be
    /// granted.
    pub fn time_to_act(&self) -> Option<Instant> {
        self.time_to_act
    }

    /// The limiter's rate when the reservation was made.
    pub fn limit(&self) -> Limit {
        self.limit
    }

    /// How long from `now` until [`time_to_act`](Reservation::time_to_act).
    pub fn delay_from(&self, now: Instant) -> Option<Duration> {
        self.time_to_act.map(|at| at.saturating_duration_since(now))
    }
}

impl ReservationLimiter<MonotonicClock> {
    /// A limiter refilling `limit` tokens per second into a bucket of
    /// `bucket` tokens. The bucket starts full.
    pub fn new(limit: f64, bucket: u32) -> Result<Self, ConfigError> {
        Ok(Self::from_limit(Limit::new(limit)?, bucket))
    }

    /// A limiter refilling one token per `interval`.
    pub fn from_interval(interval: Duration, bucket: u32) -> Result<Self, ConfigError> {
        Ok(Self::from_limit(Limit::every(interval)?, bucket))
    }

    pub fn from_limit(limit: Limit, bucket: u32) -> Self {
        Self {
            limit,
            bucket,
            state: Mutex::new(LimiterState {
                tokens: 0.0,
                last: None,
                last_event: None,
            }),
            clock: MonotonicClock::new(),
        }
    }
}

impl<C: Clock> ReservationLimiter<C> {
    /// Replaces the clock used by [`allow`](Self::allow) and to sleep in
    /// [`wait_n`](Self::wait_n).
    pub fn with_clock<K: Clock>(self, clock: K) -> ReservationLimiter<K> {
        ReservationLimiter {
            limit: self.limit,
            bucket: self.bucket,
            state: self.state,
            clock,
        }
    }

    pub fn limit(&self) -> Limit {
        self.limit
    }

    pub fn bucket(&self) -> u32 {
        self.bucket
    }

    /// The clock the limiter reads when it is not given an instant.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Whether one token is available right now.
    pub fn allow(&self) -> bool {
        self.allow_n(self.clock.now(), 1)
    }

    /// Whether `n` tokens are available at `now`, without waiting. Takes
    /// them if they are.
    pub fn allow_n(&self, now: Instant, n: u32) -> bool {
        self.reserve_n(now, n, Duration::ZERO).is_ok()
    }

    /// [`wait_n`](Self::wait_n) for a single token.
    pub fn wait(&self, now: Instant, max_future_reserve: Duration) -> bool {
        self.wait_n(now, 1, max_future_reserve)
    }

    /// Reserves `n` tokens and blocks until they are available.
    ///
    /// Returns `false` straight away, without touching the bucket, if the
    /// tokens cannot be available within `max_future_reserve`. Once granted
    /// the reservation stands: the sleep always runs to completion.
    pub fn wait_n(&self, now: Instant, n: u32, max_future_reserve: Duration) -> bool {
        let reservation = self.reserve_n(now, n, max_future_reserve);
        if !reservation.ok {
            return false;
        }
        if let Some(at) = reservation.time_to_act
            && !reservation.wait.is_zero()
        {
            self.clock.sleep_until(at);
        }
        true
    }

    /// The balance the bucket would have at `now`, without changing it.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let state = self.state.lock();
        self.refill(&state, now).1
    }

    /// Decides whether `n` tokens can be granted at `now` with at most
    /// `max_future_reserve` of waiting, and commits the debit if so.
    ///
    /// A request larger than the bucket is always rejected. A rejected
    /// reservation leaves the bucket exactly as it was.
    pub fn reserve_n(&self, now: Instant, n: u32, max_future_reserve: Duration) -> Reservation {
        let mut state = self.state.lock();
        let (now, tokens) = self.refill(&state, now);

        let remaining = tokens - f64::from(n);
        let wait = if remaining < 0.0 {
            self.limit.duration_from_tokens(-remaining)
        } else {
            Duration::ZERO
        };

        let fits = n <= self.bucket;
        let time_to_act = if fits { now.checked_add(wait) } else { None };
        let ok = time_to_act.is_some() && wait <= max_future_reserve;

        if ok {
            state.last = Some(now);
            state.last_event = time_to_act;
            state.tokens = remaining;
        } else {
            debug!(n, bucket = self.bucket, ?wait, "reservation rejected");
        }

        Reservation {
            ok,
            tokens: n,
            time_to_act,
            wait,
            limit: self.limit,
        }
    }

    /// Brings the balance forward to `now`, capped at the bucket size.
    ///
    /// An instant before the last update is answered from the last update
    /// instead, so out of order callers can neither mint tokens nor move the
    /// refill point backwards.
    fn refill(&self, state: &LimiterState, now: Instant) -> (Instant, f64) {
        let bucket = f64::from(self.bucket);
        match state.last {
            None => (now, bucket),
            Some(last) => {
                let now = now.max(last);
                let accrued = self.limit.tokens_from_duration(now.duration_since(last));
                (now, (state.tokens + accrued).min(bucket))
            }
        }
    }
}

impl<C: Clock> Strategy for ReservationLimiter<C> {
    fn process(&self) -> ControlFlow<Reason> {
        let now = self.clock.now();
        let reservation = self.reserve_n(now, 1, Duration::ZERO);
        if reservation.is_ok() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(Reason::Overloaded {
                retry_after: reservation.delay_from(now).unwrap_or(Duration::MAX),
            })
        }
    }
}

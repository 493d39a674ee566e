use std::num::NonZeroU32;
use std::time::Duration;

use quanta::Instant;
use tracing::trace;

use crate::clock::Clock;
use crate::clock::MonotonicClock;
use crate::snapshot::SnapshotCell;

/// How many request intervals an idle pacer may bank as lead time.
const DEFAULT_SLACK_PERIODS: u32 = 10;

/// A lock-free leaky bucket pacer.
///
/// Callers are serialised into an evenly spaced schedule: consecutive
/// releases are at least `1s / rate` apart. A pacer that has been idle banks
/// the unused time as *lead*, letting a short burst through without waiting,
/// but never more than [`max_slack`](LeakyBucketPacer::max_slack) worth.
///
/// The whole state is a single immutable snapshot that is replaced with a
/// compare-and-swap, so no caller ever holds a lock, and in particular no
/// caller holds anything while it sleeps.
#[derive(Debug)]
pub struct LeakyBucketPacer<C = MonotonicClock> {
    state: SnapshotCell<PacerState>,
    per_request: Duration,
    max_slack: Duration,
    clock: C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PacerState {
    /// When the most recently released caller was scheduled. `None` until the
    /// first release.
    last: Option<Instant>,
    /// Time banked by arriving later than the schedule required.
    lead: Duration,
}

/// The outcome of scheduling one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// The instant the caller is released.
    pub at: Instant,
    /// How long the caller has to wait, from the moment it was scheduled,
    /// before it reaches `at`.
    pub wait: Duration,
}

impl LeakyBucketPacer<MonotonicClock> {
    /// Creates a pacer releasing at most `rate` callers per second.
    pub fn new(rate: NonZeroU32) -> Self {
        Self::with_clock(rate, MonotonicClock::new())
    }
}

impl<C: Clock> LeakyBucketPacer<C> {
    pub fn with_clock(rate: NonZeroU32, clock: C) -> Self {
        let per_request = Duration::from_secs(1) / rate.get();
        Self {
            state: SnapshotCell::new(PacerState {
                last: None,
                lead: Duration::ZERO,
            }),
            per_request,
            max_slack: per_request * DEFAULT_SLACK_PERIODS,
            clock,
        }
    }

    /// Caps the banked lead at `periods` request intervals instead of the
    /// default of ten. Zero disables banking entirely.
    pub fn with_slack(mut self, periods: u32) -> Self {
        self.max_slack = self.per_request * periods;
        self
    }

    /// The minimum spacing between two releases.
    pub fn per_request(&self) -> Duration {
        self.per_request
    }

    /// The most lead time an idle pacer can bank.
    pub fn max_slack(&self) -> Duration {
        self.max_slack
    }

    /// Blocks until the caller's slot in the schedule and returns the
    /// instant it was released at.
    pub fn take(&self) -> Instant {
        let release = self.schedule();
        self.clock.sleep(release.wait);
        release.at
    }

    /// Claims the caller's slot in the schedule without waiting for it.
    ///
    /// The slot is committed as soon as this returns: the caller is expected
    /// to wait for [`Release::wait`] itself (e.g. on an async runtime) before
    /// proceeding.
    pub fn schedule(&self) -> Release {
        let release = self.state.update(|old| {
            let now = self.clock.now();
            match old.last {
                None => (
                    PacerState {
                        last: Some(now),
                        lead: Duration::ZERO,
                    },
                    Release {
                        at: now,
                        wait: Duration::ZERO,
                    },
                ),
                Some(last) => self.advance(old.lead, last, now),
            }
        });
        trace!(wait = ?release.wait, "pacer slot claimed");
        release
    }

    fn advance(&self, lead: Duration, last: Instant, now: Instant) -> (PacerState, Release) {
        // Positive when the caller arrived too early and owes a wait,
        // negative when it arrived late enough to bank lead time.
        let owed = nanos(self.per_request) - nanos(lead) - signed_elapsed(last, now);
        let owed = owed.max(-nanos(self.max_slack));

        if owed > 0 {
            let wait = from_nanos(owed);
            let at = now + wait;
            (
                PacerState {
                    last: Some(at),
                    lead: Duration::ZERO,
                },
                Release { at, wait },
            )
        } else {
            (
                PacerState {
                    last: Some(now),
                    lead: from_nanos(-owed),
                },
                Release {
                    at: now,
                    wait: Duration::ZERO,
                },
            )
        }
    }
}

/// `now - last` in nanoseconds; negative while `last` is still in the future.
fn signed_elapsed(last: Instant, now: Instant) -> i128 {
    if now >= last {
        nanos(now.duration_since(last))
    } else {
        -nanos(last.duration_since(now))
    }
}

fn nanos(d: Duration) -> i128 {
    d.as_nanos() as i128
}

fn from_nanos(n: i128) -> Duration {
    Duration::from_nanos(u64::try_from(n).unwrap_or(u64::MAX))
}

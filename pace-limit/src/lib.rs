//! # pace-limit
//!
//! `pace-limit` provides in-process request pacing: given a target rate and a
//! burst allowance, it decides for each caller whether an event may proceed
//! now, must wait until a computed instant, or is rejected.
//!
//! ## Core Pieces
//!
//! * [`LeakyBucketPacer`]: a lock-free pacer that serialises callers into an
//!   evenly spaced schedule. Its whole state is one immutable snapshot,
//!   replaced with a Compare-And-Swap loop, so callers never block each other
//!   and never hold anything while they sleep.
//! * [`ReservationLimiter`]: a token bucket that answers allow/deny at once,
//!   or grants *reservations* up to a caller supplied horizon and lets the
//!   caller sleep until its reservation comes due. Granted reservations are
//!   debited before the caller sleeps, so overlapping reservations queue up
//!   correctly.
//!
//! Two simpler counters complete the set: a [`SlidingWindow`] hit counter and
//! a [`TokenBucket`] refilled by a background ticker.
//!
//! ## Key Concepts
//!
//! * **Lazy Evaluation**: the pacer and the limiters recompute their state at
//!   the moment of the request. Only the ticking [`TokenBucket`] runs a task.
//! * **Injectable Time**: every component reads the time and sleeps through a
//!   [`clock::Clock`], so tests can drive them with a [`clock::FakeClock`].
//! * **Strategy Trait**: the non-blocking limiters share one admission
//!   interface.
//!
//! ## Example
//!
//! ```rust
//! use pace_limit::LeakyBucketPacer;
//! use pace_limit::ReservationLimiter;
//! use std::num::NonZeroU32;
//! use std::time::Duration;
//!
//! // At most 1000 releases per second, evenly spaced.
//! let pacer = LeakyBucketPacer::new(NonZeroU32::new(1000).unwrap());
//! let first = pacer.take();
//! let second = pacer.take();
//! assert!(second - first >= Duration::from_micros(900));
//!
//! // 10 tokens per second, bursts of up to 5.
//! let limiter = ReservationLimiter::new(10.0, 5).unwrap();
//! if limiter.allow() {
//!     // Request allowed
//! }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

pub mod clock;
mod error;
mod limiter;
mod pacer;
mod sliding_window;
mod snapshot;
mod token_bucket;

pub use error::ConfigError;
pub use limiter::Limit;
pub use limiter::Reservation;
pub use limiter::ReservationLimiter;
pub use pacer::LeakyBucketPacer;
pub use pacer::Release;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

/// Reasons why a request might be rejected by a strategy.
#[derive(Debug, PartialEq)]
pub enum Reason {
    Overloaded { retry_after: Duration },
}

/// The common interface of the non-blocking limiters.
///
/// Strategies must be `Send` and `Sync` to allow sharing across thread boundaries
/// via `Arc`.
pub trait Strategy: Debug {
    /// Attempts to admit a single request.
    ///
    /// This method never blocks.
    ///
    /// # Errors
    ///
    /// Returns `Reason` if the rate limit has been reached, with a hint of
    /// when a retry could succeed.
    fn process(&self) -> ControlFlow<Reason>;
}

//! # Tower Pace
//!
//! `tower-pace` puts the limiters of [`pace_limit`] in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! ## Layers
//!
//! * [`PaceLayer`]: spaces requests evenly with a
//!   [`LeakyBucketPacer`](pace_limit::LeakyBucketPacer). Nothing is ever
//!   rejected; requests are held in `poll_ready` until their slot.
//! * [`ReserveLayer`]: reserves a token per request from a
//!   [`ReservationLimiter`](pace_limit::ReservationLimiter), waiting up to a
//!   bound and failing with [`PaceError::RateLimited`] beyond it.
//! * [`RateLimitLayer`]: drives any [`Strategy`], either sleeping until the
//!   strategy's retry hint or failing fast.
//! * [`ManagedRateLimitLayer`]: a pre-composed stack of load shedding, a hard
//!   timeout and error mapping into [`PaceError`].
//!
//! ## Metrics
//!
//! The services count throttled requests on the global OpenTelemetry meter,
//! and count `early_wake` when a request is turned down again right after
//! sleeping out its retry hint. Without a meter provider installed these are no-ops.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`PaceError`], allowing automatic conversion
//!   to HTTP status codes (408, 429, 503, 500).

mod error;
mod gate;
mod layer;
mod managed_layer;
mod pace_layer;
mod reserve_layer;
mod service;

#[cfg(test)]
mod tests;

#[cfg(doc)]
use pace_limit::Strategy;

pub use error::PaceError;
pub use layer::RateLimitLayer;
pub use managed_layer::ManagedRateLimitLayer;
pub use pace_layer::PaceLayer;
pub use pace_layer::PaceService;
pub use reserve_layer::ReserveLayer;
pub use reserve_layer::ReserveService;
pub use service::OnThrottle;
pub use service::RateLimitService;
pub use service::ResponseFuture;

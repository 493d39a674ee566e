use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use pace_limit::ReservationLimiter;
use pace_limit::clock::Clock;
use pace_limit::clock::MonotonicClock;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::error::PaceError;
use crate::gate::Gate;
use crate::gate::Verdict;

/// Admits requests through a [`ReservationLimiter`], letting each one wait
/// up to `max_wait` for its token.
#[derive(Debug)]
pub struct ReserveLayer<C = MonotonicClock> {
    limiter: Arc<ReservationLimiter<C>>,
    max_wait: Duration,
}

impl<C> Clone for ReserveLayer<C> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            max_wait: self.max_wait,
        }
    }
}

impl<C: Clock> ReserveLayer<C> {
    /// `max_wait` of zero turns the layer into a plain allow/deny gate.
    pub fn new(limiter: Arc<ReservationLimiter<C>>, max_wait: Duration) -> Self {
        Self { limiter, max_wait }
    }
}

impl<C, S> Layer<S> for ReserveLayer<C> {
    type Service = ReserveService<C, S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReserveService::new(inner, Arc::clone(&self.limiter), self.max_wait)
    }
}

/// Reserves one token per request.
///
/// A request whose token would not be ready within `max_wait` fails with
/// [`PaceError::RateLimited`] without touching the bucket. A granted request
/// stays pending until its reservation comes due. The token is debited when
/// the reservation is granted, so concurrent requests queue behind each
/// other instead of waking up together.
#[derive(Debug)]
pub struct ReserveService<C, S> {
    inner: S,
    limiter: Arc<ReservationLimiter<C>>,
    max_wait: Duration,
    gate: Gate,
}

impl<C, S: Clone> Clone for ReserveService<C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            max_wait: self.max_wait,
            gate: self.gate.clone(),
        }
    }
}

impl<C, S> ReserveService<C, S> {
    pub fn new(inner: S, limiter: Arc<ReservationLimiter<C>>, max_wait: Duration) -> Self {
        Self {
            inner,
            limiter,
            max_wait,
            gate: Gate::new("reserve_service", "reservation"),
        }
    }
}

fn reserve<C: Clock>(limiter: &ReservationLimiter<C>, max_wait: Duration) -> Verdict {
    let now = limiter.clock().now();
    let reservation = limiter.reserve_n(now, 1, max_wait);
    let delay = reservation.delay_from(now);
    if reservation.is_ok() {
        return Verdict::Hold(delay.unwrap_or_default());
    }
    // The earliest a retry could fit within max_wait.
    let retry_after = delay.map_or(Duration::MAX, |d| d.saturating_sub(max_wait));
    Verdict::Refuse(PaceError::RateLimited { retry_after })
}

impl<C, S, Req> Service<Req> for ReserveService<C, S>
where
    C: Clock + 'static,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.gate.poll_sleep(cx))?;
        ready!(self.inner.poll_ready(cx))?;

        let (limiter, max_wait) = (&self.limiter, self.max_wait);
        self.gate
            .poll_admit(cx, || reserve(limiter, max_wait))
            .map_err(Into::into)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.gate.release();
        self.inner.call(req)
    }
}

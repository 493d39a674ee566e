use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::time::Timeout;
use tokio::time::timeout;
use tower::BoxError;
use tower::Service;

use pace_limit::Reason;
use pace_limit::Strategy;

use crate::error::PaceError;
use crate::gate::Gate;
use crate::gate::Verdict;

/// Stands in for "no timeout" on the inner call.
const FOREVER: Duration = Duration::from_secs(3600 * 24 * 365);

/// What a [`RateLimitService`] does with a request its strategy turns down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnThrottle {
    /// Sleep for the strategy's retry hint, then ask again.
    #[default]
    Wait,
    /// Fail at once with [`PaceError::RateLimited`].
    Reject,
}

/// Holds requests back until a [`Strategy`] admits them.
#[derive(Debug)]
pub struct RateLimitService<L, S>
where
    L: ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    on_throttle: OnThrottle,
    gate: Gate,
}

impl<L, S> Clone for RateLimitService<L, S>
where
    L: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            on_throttle: self.on_throttle,
            gate: self.gate.clone(),
        }
    }
}

impl<L, S> RateLimitService<L, S>
where
    L: ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        Self {
            inner,
            limiter,
            on_throttle: OnThrottle::Wait,
            gate: Gate::new("rate_limit_service", "strategy"),
        }
    }

    pub fn with_fail_fast(self, fail_fast: bool) -> Self {
        self.on_throttle(if fail_fast {
            OnThrottle::Reject
        } else {
            OnThrottle::Wait
        })
    }

    pub fn on_throttle(mut self, on_throttle: OnThrottle) -> Self {
        self.on_throttle = on_throttle;
        self
    }

    /// One budget covering both the wait for admission and the inner call.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_budget(Some(timeout))
    }

    pub(crate) fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.gate = self.gate.with_budget(budget);
        self
    }
}

impl<L, S, Req> Service<Req> for RateLimitService<L, S>
where
    L: Strategy + ?Sized + Send + Sync + 'static,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.gate.poll_sleep(cx))?;
        // Capacity is only taken for a request the inner service can accept.
        ready!(self.inner.poll_ready(cx))?;

        let limiter = &self.limiter;
        let on_throttle = self.on_throttle;
        self.gate
            .poll_admit(cx, || match (limiter.process(), on_throttle) {
                (ControlFlow::Continue(()), _) => Verdict::Admit,
                (ControlFlow::Break(Reason::Overloaded { retry_after }), OnThrottle::Wait) => {
                    Verdict::Retry(retry_after)
                }
                (ControlFlow::Break(Reason::Overloaded { retry_after }), OnThrottle::Reject) => {
                    Verdict::Refuse(PaceError::RateLimited { retry_after })
                }
            })
            .map_err(Into::into)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let budget = self.gate.release().unwrap_or(FOREVER);
        ResponseFuture::new(self.inner.call(req), budget)
    }
}

pin_project! {
    /// The inner service's future under whatever is left of the time budget.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: Timeout<F>,
    }
}

impl<F: Future> ResponseFuture<F> {
    pub(crate) fn new(inner: F, budget: Duration) -> Self {
        Self {
            inner: timeout(budget, inner),
        }
    }
}

impl<F, T> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, BoxError>>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().inner.poll(cx)) {
            Ok(res) => Poll::Ready(res),
            Err(_) => Poll::Ready(Err(PaceError::Timeout.into())),
        }
    }
}

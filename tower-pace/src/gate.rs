//! The readiness state machine shared by the services: ask a limiter, and
//! either let the request through, hold it until its slot, back off and
//! ask again, or refuse it.

use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tokio::time::Instant;
use tokio::time::Sleep;
use tokio::time::sleep;
use tracing::debug;

use crate::error::PaceError;

/// What a limiter decided about the request being readied.
#[derive(Debug)]
pub(crate) enum Verdict {
    /// Go ahead now.
    Admit,
    /// Admitted, but only once this much time has passed. The capacity is
    /// already spoken for, so the gate does not ask again.
    Hold(Duration),
    /// Not admitted; ask again after this long.
    Retry(Duration),
    /// Not admitted, and not worth waiting for.
    Refuse(PaceError),
}

#[derive(Clone, Debug)]
struct GateMetrics {
    throttled: Counter<u64>,
    early_wake: Counter<u64>,
    attributes: [KeyValue; 1],
}

/// Tracks one request from the first `poll_ready` to `call`.
///
/// An optional budget bounds how long a request may spend being retried;
/// it starts with the first verdict and whatever is left of it is handed
/// back by [`Gate::release`] for the inner call.
#[derive(Debug)]
pub(crate) struct Gate {
    sleep: Option<Pin<Box<Sleep>>>,
    admitted: bool,
    /// Set when a retry sleep has run out and the limiter has not been asked
    /// again yet.
    retrying: bool,
    budget: Option<Duration>,
    deadline: Option<Instant>,
    metrics: GateMetrics,
}

impl Clone for Gate {
    /// A clone shares the configuration, never the request in flight.
    fn clone(&self) -> Self {
        Self::new_with(self.budget, self.metrics.clone())
    }
}

impl Gate {
    pub(crate) fn new(meter: &'static str, limiter: &'static str) -> Self {
        let meter = global::meter(meter);
        Self::new_with(
            None,
            GateMetrics {
                throttled: meter.u64_counter("throttled").build(),
                early_wake: meter.u64_counter("early_wake").build(),
                attributes: [KeyValue::new("limiter", limiter)],
            },
        )
    }

    fn new_with(budget: Option<Duration>, metrics: GateMetrics) -> Self {
        Self {
            sleep: None,
            admitted: false,
            retrying: false,
            budget,
            deadline: None,
            metrics,
        }
    }

    pub(crate) fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    /// Finishes any sleep in progress. Fails with [`PaceError::Timeout`] if
    /// the budget ran out while retrying.
    pub(crate) fn poll_sleep(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), PaceError>> {
        if let Some(fut) = self.sleep.as_mut() {
            if fut.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            self.sleep = None;
            self.retrying = !self.admitted;
        }
        if !self.admitted && self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.deadline = None;
            self.retrying = false;
            return Poll::Ready(Err(PaceError::Timeout));
        }
        Poll::Ready(Ok(()))
    }

    /// Asks `decide` for a verdict unless the request already has one.
    ///
    /// Call only once the inner service is ready, so capacity is never
    /// claimed for a request that cannot be sent.
    pub(crate) fn poll_admit<F>(&mut self, cx: &mut Context<'_>, decide: F) -> Poll<Result<(), PaceError>>
    where
        F: FnOnce() -> Verdict,
    {
        if self.admitted {
            return Poll::Ready(Ok(()));
        }

        let now = Instant::now();
        if let Some(budget) = self.budget {
            let deadline = *self.deadline.get_or_insert(now + budget);
            if now >= deadline {
                self.deadline = None;
                return Poll::Ready(Err(PaceError::Timeout));
            }
        }

        let woke = std::mem::take(&mut self.retrying);
        let pause = match decide() {
            Verdict::Admit => {
                self.admitted = true;
                return Poll::Ready(Ok(()));
            }
            Verdict::Hold(wait) => {
                self.admitted = true;
                if wait.is_zero() {
                    return Poll::Ready(Ok(()));
                }
                wait
            }
            Verdict::Retry(retry_after) => {
                self.throttled(woke);
                match self.deadline {
                    Some(deadline) => retry_after.min(deadline.saturating_duration_since(now)),
                    None => retry_after,
                }
            }
            Verdict::Refuse(err) => {
                self.throttled(woke);
                self.deadline = None;
                debug!(%err, "request refused");
                return Poll::Ready(Err(err));
            }
        };

        let mut fut = Box::pin(sleep(pause));
        if fut.as_mut().poll(cx).is_pending() {
            self.sleep = Some(fut);
            return Poll::Pending;
        }
        if self.admitted {
            return Poll::Ready(Ok(()));
        }
        // A zero length back-off: go round again.
        self.retrying = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }

    /// Consumes the admission for `call` and returns what is left of the
    /// budget, if there is one.
    pub(crate) fn release(&mut self) -> Option<Duration> {
        self.admitted = false;
        let deadline = self.deadline.take();
        self.budget
            .map(|budget| deadline.map_or(budget, |d| d.saturating_duration_since(Instant::now())))
    }

    fn throttled(&self, after_wake: bool) {
        self.metrics.throttled.add(1, &self.metrics.attributes);
        if after_wake {
            self.metrics.early_wake.add(1, &self.metrics.attributes);
        }
    }
}

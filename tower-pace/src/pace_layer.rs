use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use pace_limit::LeakyBucketPacer;
use pace_limit::clock::Clock;
use pace_limit::clock::MonotonicClock;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tracing::trace;

use crate::gate::Gate;
use crate::gate::Verdict;

/// Spaces requests out with a [`LeakyBucketPacer`].
///
/// Every service built by this layer shares the same pacer, so the spacing
/// holds across clones and across the tasks driving them.
#[derive(Debug)]
pub struct PaceLayer<C = MonotonicClock> {
    pacer: Arc<LeakyBucketPacer<C>>,
}

impl<C> Clone for PaceLayer<C> {
    fn clone(&self) -> Self {
        Self {
            pacer: Arc::clone(&self.pacer),
        }
    }
}

impl<C: Clock> PaceLayer<C> {
    pub fn new(pacer: Arc<LeakyBucketPacer<C>>) -> Self {
        Self { pacer }
    }
}

impl<C, S> Layer<S> for PaceLayer<C> {
    type Service = PaceService<C, S>;

    fn layer(&self, inner: S) -> Self::Service {
        PaceService::new(inner, Arc::clone(&self.pacer))
    }
}

/// Claims one slot in the pacer's schedule per request and stays pending
/// until that slot comes up.
///
/// The slot is claimed once the inner service is ready, and the wait runs on
/// the Tokio timer, so a paced request never blocks a worker thread. A
/// claimed slot is kept until the next [`call`](Service::call): polling for
/// readiness again does not claim another one.
#[derive(Debug)]
pub struct PaceService<C, S> {
    inner: S,
    pacer: Arc<LeakyBucketPacer<C>>,
    gate: Gate,
}

impl<C, S: Clone> Clone for PaceService<C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pacer: Arc::clone(&self.pacer),
            gate: self.gate.clone(),
        }
    }
}

impl<C, S> PaceService<C, S> {
    pub fn new(inner: S, pacer: Arc<LeakyBucketPacer<C>>) -> Self {
        Self {
            inner,
            pacer,
            gate: Gate::new("pace_service", "pacer"),
        }
    }
}

impl<C, S, Req> Service<Req> for PaceService<C, S>
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

        let pacer = &self.pacer;
        self.gate
            .poll_admit(cx, || {
                let release = pacer.schedule();
                if !release.wait.is_zero() {
                    trace!(wait = ?release.wait, "pacing request");
                }
                Verdict::Hold(release.wait)
            })
            .map_err(Into::into)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.gate.release();
        self.inner.call(req)
    }
}

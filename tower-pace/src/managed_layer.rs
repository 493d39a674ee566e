use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use pace_limit::Strategy;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::util::BoxCloneSyncService;

use crate::PaceError;
use crate::RateLimitService;

/// A rate limiting stack that sheds excess load instead of queueing it.
///
/// The strategy is wrapped in Tower's load shedding and a hard timeout:
///
/// - A request arriving while the strategy is throttling is rejected at once
///   with [`PaceError::Overloaded`].
/// - A request whose inner call outlives `max_wait` fails with
///   [`PaceError::Timeout`].
/// - Any other inner error becomes [`PaceError::Inner`].
pub struct ManagedRateLimitLayer<L, Req> {
    limiter: Arc<L>,
    max_wait: Duration,
    _phantom: PhantomData<fn(Req)>,
}

// Derived Clone would require `Req: Clone`, which Axum request types are not.
impl<L, Req> Clone for ManagedRateLimitLayer<L, Req> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            max_wait: self.max_wait,
            _phantom: PhantomData,
        }
    }
}

impl<L: Strategy, Req> ManagedRateLimitLayer<L, Req> {
    pub fn new(limiter: Arc<L>, max_wait: Duration) -> Self {
        Self {
            limiter,
            max_wait,
            _phantom: PhantomData,
        }
    }
}

/// Folds the errors of the managed stack into [`PaceError`].
fn into_pace_error(err: BoxError) -> BoxError {
    if err.is::<tower::timeout::error::Elapsed>() {
        BoxError::from(PaceError::Timeout)
    } else if err.is::<tower::load_shed::error::Overloaded>() {
        BoxError::from(PaceError::Overloaded)
    } else if err.is::<PaceError>() {
        err
    } else {
        Box::from(PaceError::Inner(err.to_string()))
    }
}

impl<S, L, Req> Layer<S> for ManagedRateLimitLayer<L, Req>
where
    L: Strategy + Send + Sync + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Send + 'static,
{
    type Service = BoxCloneSyncService<Req, S::Response, BoxError>;

    fn layer(&self, inner: S) -> Self::Service {
        let rl = RateLimitService::new(inner, self.limiter.clone());

        // Timeout is outermost so the deadline covers the whole request.
        let svc = tower::ServiceBuilder::new()
            .timeout(self.max_wait)
            .load_shed()
            .service(rl);

        BoxCloneSyncService::new(tower::util::MapErr::new(svc, into_pace_error))
    }
}

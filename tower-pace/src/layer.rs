use std::sync::Arc;
use std::time::Duration;

use pace_limit::Strategy;
use tower::Layer;

use crate::service::OnThrottle;
use crate::service::RateLimitService;

/// Puts a shared [`Strategy`] in front of a service.
///
/// ```
/// # use std::num::NonZeroUsize;
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// use pace_limit::SlidingWindow;
/// use tower_pace::OnThrottle;
/// use tower_pace::RateLimitLayer;
///
/// let window = SlidingWindow::new(NonZeroUsize::new(50).unwrap(), Duration::from_secs(1));
/// let layer = RateLimitLayer::new(Arc::new(window))
///     .on_throttle(OnThrottle::Reject)
///     .with_timeout(Duration::from_millis(250));
/// # let _ = layer;
/// ```
#[derive(Debug)]
pub struct RateLimitLayer<L: ?Sized> {
    limiter: Arc<L>,
    on_throttle: OnThrottle,
    budget: Option<Duration>,
}

impl<L: ?Sized> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            on_throttle: self.on_throttle,
            budget: self.budget,
        }
    }
}

impl<L: Strategy + ?Sized> RateLimitLayer<L> {
    pub fn new(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            on_throttle: OnThrottle::default(),
            budget: None,
        }
    }

    pub fn on_throttle(mut self, on_throttle: OnThrottle) -> Self {
        self.on_throttle = on_throttle;
        self
    }

    /// Shorthand for [`OnThrottle::Reject`] when `true`.
    pub fn with_fail_fast(self, fail_fast: bool) -> Self {
        self.on_throttle(if fail_fast {
            OnThrottle::Reject
        } else {
            OnThrottle::Wait
        })
    }

    /// Requests that spend longer than `timeout` waiting for admission and
    /// then in the inner service fail with `PaceError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.budget = Some(timeout);
        self
    }
}

impl<L: ?Sized, S> Layer<S> for RateLimitLayer<L> {
    type Service = RateLimitService<L, S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService::new(inner, Arc::clone(&self.limiter))
            .on_throttle(self.on_throttle)
            .with_budget(self.budget)
    }
}

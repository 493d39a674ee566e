use std::num::NonZeroU32;
use std::num::NonZeroU64;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use more_asserts::assert_ge;
use more_asserts::assert_lt;
use pace_limit::LeakyBucketPacer;
use pace_limit::Reason;
use pace_limit::ReservationLimiter;
use pace_limit::SlidingWindow;
use pace_limit::Strategy;
use pace_limit::TokenBucket;
use pace_limit::clock::Clock;
use pace_limit::clock::FakeClock;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

use futures::future::Ready;
use futures::future::ready;

#[derive(Clone, Debug)]
struct MockService {
    pub count: Arc<AtomicUsize>,
}

impl MockService {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Service<()> for MockService {
    type Response = ();
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        ready(Ok(()))
    }
}

/// A clock that follows Tokio's (pausable) timeline, so limiters and the
/// services' timers agree on what time it is.
#[derive(Debug, Clone)]
struct TokioClock {
    origin: tokio::time::Instant,
    seen: Arc<Mutex<Duration>>,
    fake: FakeClock,
}

impl TokioClock {
    fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            seen: Arc::new(Mutex::new(Duration::ZERO)),
            fake: FakeClock::new(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> quanta::Instant {
        let elapsed = self.origin.elapsed();
        let mut seen = self.seen.lock().unwrap();
        if elapsed > *seen {
            self.fake.advance(elapsed - *seen);
            *seen = elapsed;
        }
        self.fake.now()
    }

    fn sleep(&self, _duration: Duration) {
        unreachable!("the services never block");
    }
}

// A mock strategy that blocks exactly once, then allows everything
#[derive(Debug)]
struct InstantRecoveryStrategy {
    already_blocked: AtomicBool,
}

impl Strategy for InstantRecoveryStrategy {
    fn process(&self) -> ControlFlow<Reason> {
        if self.already_blocked.swap(true, Ordering::SeqCst) {
            ControlFlow::Continue(())
        } else {
            // Hint an immediate recovery
            ControlFlow::Break(Reason::Overloaded {
                retry_after: Duration::from_nanos(0),
            })
        }
    }
}

fn rate_limited(err: BoxError) -> Duration {
    match err.downcast_ref::<PaceError>() {
        Some(PaceError::RateLimited { retry_after }) => *retry_after,
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

macro_rules! test_limiter_service {
    ($name:ident, $strategy_init:expr) => {
        #[cfg(test)]
        mod $name {
            use super::*;
            use tokio::time::advance;
            use tokio::time::pause;

            #[tokio::test]
            async fn test_poll_ready_backpressure() {
                pause();

                let capacity = NonZeroUsize::new(2).unwrap();
                let interval = Duration::from_millis(100);
                let strategy = ($strategy_init)(capacity, interval, TokioClock::new());

                let mut service = RateLimitService::new(MockService::new(), Arc::new(strategy));

                let _ = service.ready().await.unwrap();
                service.call(()).await.unwrap();

                let _ = service.ready().await.unwrap();
                service.call(()).await.unwrap();

                // The third request must wait for the limiter
                let mut ready_fut = service.ready();
                tokio::select! {
                    _ = &mut ready_fut => panic!("Should be throttled!"),
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }

                advance(Duration::from_millis(110)).await;

                ready_fut.await.expect("Should recover");
                service.call(()).await.unwrap();
            }
        }
    };
}

test_limiter_service!(
    sliding_window_tests,
    |cap, int, clock| SlidingWindow::with_clock(cap, int, clock)
);

test_limiter_service!(
    reservation_limiter_tests,
    |cap: NonZeroUsize, int: Duration, clock| {
        let bucket = cap.get() as u32;
        ReservationLimiter::from_interval(int / bucket, bucket)
            .unwrap()
            .with_clock(clock)
    }
);

#[tokio::test]
async fn test_token_bucket_starts_empty_and_refills() {
    tokio::time::pause();

    let bucket = TokenBucket::start(NonZeroU64::new(2).unwrap(), Duration::from_millis(100)).unwrap();
    let mut service = RateLimitService::new(MockService::new(), Arc::new(bucket));

    let start = tokio::time::Instant::now();
    service.ready().await.unwrap().call(()).await.unwrap();

    // The first tick lands at 100ms, and a retry follows one period after the refusal.
    assert_ge!(start.elapsed(), Duration::from_millis(100));
    assert_lt!(start.elapsed(), Duration::from_millis(250));
}

#[tokio::test]
async fn test_layer_integration() {
    let limiter = SlidingWindow::new(NonZeroUsize::new(100).unwrap(), Duration::from_secs(1));

    let mut service = tower::ServiceBuilder::new()
        .layer(RateLimitLayer::new(Arc::new(limiter)))
        .service(MockService::new());

    // Verify it handles a basic request
    service.ready().await.unwrap().call(()).await.unwrap();
}

#[tokio::test]
async fn test_shared_state_across_clones() {
    let rl = ReservationLimiter::from_interval(Duration::from_secs(10), 1).unwrap();
    let layer = RateLimitLayer::new(Arc::new(rl));

    let mut svc1 = layer.layer(MockService::new());
    let mut svc2 = layer.layer(MockService::new());

    svc1.ready().await.unwrap().call(()).await.unwrap();

    // svc2 should now be throttled because svc1 used the token
    assert!(futures::poll!(svc2.ready()).is_pending());
}

#[tokio::test]
async fn test_fail_fast_reports_retry_hint() {
    tokio::time::pause();

    let clock = TokioClock::new();
    let rl = ReservationLimiter::from_interval(Duration::from_millis(100), 1)
        .unwrap()
        .with_clock(clock);
    let layer = RateLimitLayer::new(Arc::new(rl)).with_fail_fast(true);
    let mut svc = layer.layer(MockService::new());

    svc.ready().await.unwrap().call(()).await.unwrap();
    let err = svc.ready().await.unwrap_err();
    let retry_after = rate_limited(err);
    assert_ge!(retry_after, Duration::from_millis(99));
    assert_lt!(retry_after, Duration::from_millis(101));
}

#[tokio::test]
async fn test_timeout_while_throttled() {
    tokio::time::pause();

    let rl = ReservationLimiter::from_interval(Duration::from_secs(10), 1)
        .unwrap()
        .with_clock(TokioClock::new());
    let layer = RateLimitLayer::new(Arc::new(rl)).with_timeout(Duration::from_millis(50));
    let mut svc = layer.layer(MockService::new());

    svc.ready().await.unwrap().call(()).await.unwrap();

    let err = svc.ready().await.unwrap_err();
    assert_eq!(err.downcast_ref::<PaceError>(), Some(&PaceError::Timeout));
}

#[tokio::test]
async fn test_concurrent_hammer() {
    let capacity = 50;
    let strategy = Arc::new(SlidingWindow::new(
        NonZeroUsize::new(capacity).unwrap(),
        Duration::from_millis(100),
    ));

    let mock = MockService::new();
    let mock_count = mock.count.clone();

    let service = RateLimitService::new(mock, strategy);
    let service = tower::buffer::Buffer::new(service, 100);

    let mut handles = vec![];
    for _ in 0..100 {
        let mut svc = service.clone();
        handles.push(tokio::spawn(async move {
            // This will block until the service is ready
            let _ = svc.ready().await.expect("Service should stay healthy");
            svc.call(()).await
        }));
    }

    // Only the first 50 can finish before the window turns over; stop
    // waiting well before that.
    let mut completed = 0;
    let timeout = tokio::time::sleep(Duration::from_millis(50));
    tokio::pin!(timeout);

    for h in handles {
        tokio::select! {
            res = h => {
                res.expect("Task panicked").expect("Call failed");
                completed += 1;
            }
            _ = &mut timeout => {
                break;
            }
        }
    }

    assert_eq!(
        mock_count.load(Ordering::SeqCst),
        capacity,
        "Limiter allowed more/less than capacity under pressure"
    );
    assert_eq!(
        completed, capacity,
        "Tasks completed count doesn't match allowed capacity"
    );
}

#[tokio::test]
async fn test_immediate_recovery() {
    let strategy = Arc::new(InstantRecoveryStrategy {
        already_blocked: AtomicBool::new(false),
    });
    let mut service = RateLimitService::new(MockService::new(), strategy);

    // The 0ms hint registers a sleep(0) and returns Pending.
    let ready_fut = service.ready();

    // We yield to the executor to let the 0ms timer fire immediately
    tokio::task::yield_now().await;

    ready_fut
        .await
        .expect("Should recover immediately from 0ms hint");
    service.call(()).await.unwrap();
}

#[tokio::test]
async fn test_managed_layer_cloning_concurrency() {
    let capacity = 5;
    let limiter = SlidingWindow::new(
        NonZeroUsize::new(capacity).unwrap(),
        Duration::from_secs(60),
    );

    // Create the Managed Layer (Wait up to 100ms before failing)
    let layer = ManagedRateLimitLayer::new(Arc::new(limiter), Duration::from_millis(100));

    let mock = MockService::new();
    let mock_count = mock.count.clone();
    let service = ServiceBuilder::new().layer(layer).service(mock);

    let mut handles = vec![];

    // Fire 20 requests from 20 different clones
    for _ in 0..20 {
        let mut cloned_svc = service.clone();
        handles.push(tokio::spawn(async move {
            let ready_svc = cloned_svc.ready().await?;
            ready_svc.call(()).await
        }));
    }

    let mut success = 0;
    let mut failure = 0;

    for h in handles {
        match h.await.unwrap() {
            Ok(_) => success += 1,
            Err(e) => {
                assert_eq!(e.downcast_ref::<PaceError>(), Some(&PaceError::Overloaded));
                failure += 1;
            }
        }
    }

    assert_eq!(success, capacity, "Should have exactly 5 successes");
    assert_eq!(failure, 15, "Remaining 15 should have been shed");
    assert_eq!(
        mock_count.load(Ordering::SeqCst),
        capacity,
        "Inner service should only see 5 hits"
    );
}

mod budget {
    use super::*;
    use tokio::time::sleep;
    use tower::service_fn;

    async fn spends_budget(slow: Duration) -> Result<(), BoxError> {
        tokio::time::pause();

        let rl = ReservationLimiter::from_interval(Duration::from_millis(60), 1)
            .unwrap()
            .with_clock(TokioClock::new());
        assert!(rl.allow());
        let layer = RateLimitLayer::new(Arc::new(rl)).with_timeout(Duration::from_millis(100));
        let mut svc = layer.layer(service_fn(move |()| async move {
            sleep(slow).await;
            Ok::<_, BoxError>(())
        }));

        // Waits about 60ms for the next token; the rest is left for the call.
        svc.ready().await?.call(()).await
    }

    #[tokio::test]
    async fn call_fits_in_what_is_left() {
        spends_budget(Duration::from_millis(30)).await.unwrap();
    }

    #[tokio::test]
    async fn call_overrunning_what_is_left_times_out() {
        let err = spends_budget(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.downcast_ref::<PaceError>(), Some(&PaceError::Timeout));
    }

    #[tokio::test]
    async fn reject_mode_does_not_sleep() {
        tokio::time::pause();

        let rl = ReservationLimiter::from_interval(Duration::from_secs(1), 1)
            .unwrap()
            .with_clock(TokioClock::new());
        let mut svc = RateLimitLayer::new(Arc::new(rl))
            .on_throttle(OnThrottle::Reject)
            .layer(MockService::new());

        svc.ready().await.unwrap().call(()).await.unwrap();
        let start = tokio::time::Instant::now();
        assert!(svc.ready().await.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}

mod pace {
    use super::*;
    use tokio::time::Instant;

    fn pacer(rate: u32) -> Arc<LeakyBucketPacer<TokioClock>> {
        Arc::new(LeakyBucketPacer::with_clock(
            NonZeroU32::new(rate).unwrap(),
            TokioClock::new(),
        ))
    }

    #[tokio::test]
    async fn sequential_requests_are_spaced() {
        tokio::time::pause();

        let mock = MockService::new();
        let mut svc = PaceLayer::new(pacer(100)).layer(mock.clone());

        let start = Instant::now();
        for _ in 0..5 {
            svc.ready().await.unwrap().call(()).await.unwrap();
        }

        assert_eq!(mock.count.load(Ordering::SeqCst), 5);
        assert_ge!(start.elapsed(), Duration::from_millis(40));
        assert_lt!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn readiness_claims_one_slot() {
        tokio::time::pause();

        let pacer = pacer(100);
        let mut svc = PaceLayer::new(Arc::clone(&pacer)).layer(MockService::new());

        svc.ready().await.unwrap();
        // Already released: asking again must not queue another slot.
        svc.ready().await.unwrap();
        svc.call(()).await.unwrap();

        assert_eq!(pacer.schedule().wait, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn concurrent_clones_share_the_schedule() {
        tokio::time::pause();

        let svc = PaceLayer::new(pacer(100)).layer(MockService::new());
        let start = Instant::now();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mut svc = svc.clone();
                tokio::spawn(async move {
                    svc.ready().await.unwrap().call(()).await.unwrap();
                    Instant::now()
                })
            })
            .collect();

        let mut releases = Vec::new();
        for h in handles {
            releases.push(h.await.unwrap());
        }
        releases.sort();

        for pair in releases.windows(2) {
            assert_ge!(pair[1] - pair[0], Duration::from_millis(9));
        }
        assert_ge!(releases[9] - start, Duration::from_millis(90));
    }

    #[tokio::test]
    async fn idle_pacer_lets_a_burst_through() {
        tokio::time::pause();

        let mut svc = PaceLayer::new(pacer(100)).layer(MockService::new());
        svc.ready().await.unwrap().call(()).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;

        let start = Instant::now();
        for _ in 0..11 {
            svc.ready().await.unwrap().call(()).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        svc.ready().await.unwrap().call(()).await.unwrap();
        assert_ge!(start.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn pending_polls_hold_on_to_one_slot() {
        tokio::time::pause();

        let pacer = pacer(100);
        let mut svc = PaceLayer::new(Arc::clone(&pacer)).layer(MockService::new());
        svc.ready().await.unwrap().call(()).await.unwrap();

        for _ in 0..3 {
            assert!(futures::poll!(svc.ready()).is_pending());
        }
        // Slots at 0ms and 10ms are gone, nothing more.
        assert_eq!(pacer.schedule().wait, Duration::from_millis(20));
    }
}

mod reserve {
    use super::*;
    use tokio::time::Instant;

    fn limiter(interval: Duration, bucket: u32) -> Arc<ReservationLimiter<TokioClock>> {
        Arc::new(
            ReservationLimiter::from_interval(interval, bucket)
                .unwrap()
                .with_clock(TokioClock::new()),
        )
    }

    #[tokio::test]
    async fn granted_requests_queue_up() {
        tokio::time::pause();

        let layer = ReserveLayer::new(limiter(Duration::from_millis(100), 1), Duration::from_secs(1));
        let mut svc = layer.layer(MockService::new());

        let start = Instant::now();
        for _ in 0..4 {
            svc.ready().await.unwrap().call(()).await.unwrap();
        }
        assert_ge!(start.elapsed(), Duration::from_millis(299));
        assert_lt!(start.elapsed(), Duration::from_millis(310));
    }

    #[tokio::test]
    async fn refuses_beyond_max_wait_without_consuming() {
        tokio::time::pause();

        let limiter = limiter(Duration::from_millis(100), 1);
        let layer = ReserveLayer::new(Arc::clone(&limiter), Duration::from_millis(50));
        let mut svc = layer.layer(MockService::new());

        svc.ready().await.unwrap().call(()).await.unwrap();

        let retry_after = rate_limited(svc.ready().await.unwrap_err());
        assert_ge!(retry_after, Duration::from_millis(49));
        assert_lt!(retry_after, Duration::from_millis(51));

        // The refusal left the bucket alone: after the hint the request fits.
        tokio::time::advance(retry_after).await;
        let start = Instant::now();
        svc.ready().await.unwrap().call(()).await.unwrap();
        assert_lt!(start.elapsed(), Duration::from_millis(52));
    }

    #[tokio::test]
    async fn zero_max_wait_is_allow_or_deny() {
        tokio::time::pause();

        let layer = ReserveLayer::new(limiter(Duration::from_millis(100), 2), Duration::ZERO);
        let mut svc = layer.layer(MockService::new());

        svc.ready().await.unwrap().call(()).await.unwrap();
        svc.ready().await.unwrap().call(()).await.unwrap();
        assert!(svc.ready().await.is_err());
    }

    #[tokio::test]
    async fn concurrent_reservations_are_spread_out() {
        tokio::time::pause();

        let mock = MockService::new();
        let svc = ReserveLayer::new(limiter(Duration::from_millis(100), 1), Duration::from_secs(1))
            .layer(mock.clone());
        let start = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let mut svc = svc.clone();
                tokio::spawn(async move {
                    svc.ready().await.unwrap().call(()).await.unwrap();
                    Instant::now()
                })
            })
            .collect();

        let mut done = Vec::new();
        for h in handles {
            done.push(h.await.unwrap() - start);
        }
        done.sort();

        assert_eq!(mock.count.load(Ordering::SeqCst), 5);
        assert_lt!(done[0], Duration::from_millis(1));
        assert_ge!(done[4], Duration::from_millis(399));
    }
}

mod readiness {
    use super::*;
    use tower_test::mock;

    #[tokio::test]
    async fn reserve_waits_for_inner_before_reserving() {
        tokio::time::pause();

        let limiter = Arc::new(
            ReservationLimiter::from_interval(Duration::from_millis(100), 1)
                .unwrap()
                .with_clock(TokioClock::new()),
        );
        let (mut svc, mut handle) =
            mock::spawn_layer::<(), (), _>(ReserveLayer::new(Arc::clone(&limiter), Duration::ZERO));

        handle.allow(0);
        assert!(svc.poll_ready::<()>().is_pending());
        assert_eq!(limiter.tokens_at(limiter.clock().now()), 1.0);

        handle.allow(1);
        assert!(svc.poll_ready::<()>().is_ready());
        assert_eq!(limiter.tokens_at(limiter.clock().now()), 0.0);
    }

    #[tokio::test]
    async fn pace_waits_for_inner_before_claiming_a_slot() {
        tokio::time::pause();

        let pacer = Arc::new(LeakyBucketPacer::with_clock(
            NonZeroU32::new(100).unwrap(),
            TokioClock::new(),
        ));
        let (mut svc, mut handle) =
            mock::spawn_layer::<(), (), _>(PaceLayer::new(Arc::clone(&pacer)));

        handle.allow(0);
        assert!(svc.poll_ready::<()>().is_pending());

        // No slot was taken, so the pacer is still unused.
        assert_eq!(pacer.schedule().wait, Duration::ZERO);
        assert_eq!(pacer.schedule().wait, Duration::from_millis(10));
    }
}

use std::num::NonZeroU64;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::Reason;
use super::Strategy;
use crate::error::ConfigError;

/// A token counter refilled by a background ticker.
///
/// Starts empty and gains one token per `period`, up to `bucket` tokens. The
/// ticker is a Tokio task owned by the bucket: it runs from
/// [`start`](TokenBucket::start) until [`close`](TokenBucket::close) or drop.
#[derive(Debug)]
pub struct TokenBucket {
    bucket: u64,
    count: Arc<AtomicU64>,
    period: Duration,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    ticker: JoinHandle<()>,
}

impl TokenBucket {
    /// Starts the ticker.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(bucket: NonZeroU64, period: Duration) -> Result<Self, ConfigError> {
        if period.is_zero() {
            return Err(ConfigError::ZeroInterval(period));
        }
        let bucket = bucket.get();
        let count = Arc::new(AtomicU64::new(0));
        let (stop, stopped) = oneshot::channel();
        let ticker = tokio::spawn(refill(Arc::clone(&count), bucket, period, stopped));
        debug!(bucket, ?period, "token bucket ticker started");

        Ok(Self {
            bucket,
            count,
            period,
            stop: Mutex::new(Some(stop)),
            ticker,
        })
    }

    /// Tokens currently available.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn bucket(&self) -> u64 {
        self.bucket
    }

    /// Takes `n` tokens if they are all there, otherwise none.
    pub fn take(&self, n: u64) -> bool {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(n)
            })
            .is_ok()
    }

    /// Takes a single token.
    pub fn limit(&self) -> bool {
        self.take(1)
    }

    /// Stops refilling. Tokens already in the bucket can still be taken.
    pub fn close(&self) {
        if let Some(stop) = self.stop.lock().take() {
            // The ticker only goes away by being told to or by being aborted.
            let _ = stop.send(());
        }
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

async fn refill(
    count: Arc<AtomicU64>,
    bucket: u64,
    period: Duration,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => {
                debug!("token bucket ticker stopped");
                return;
            }
            _ = ticker.tick() => {
                // Full is fine: the tick is simply lost.
                let _ = count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    (current < bucket).then_some(current + 1)
                });
            }
        }
    }
}

impl Strategy for TokenBucket {
    fn process(&self) -> ControlFlow<Reason> {
        if self.take(1) {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(Reason::Overloaded {
                retry_after: self.period,
            })
        }
    }
}

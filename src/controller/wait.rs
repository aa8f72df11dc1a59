//! Bounded polling with an injectable clock
//!
//! Long waits inside a reconcile pass (the restart sweep, waiting for member
//! pods to terminate before metadata cleanup) go through [`Poller`] so they
//! always have an upper bound and can be tested without real delays.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::controller::error::{Error, Result};

/// Source of time for [`Poller`]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Clock backed by the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Poll a condition at a fixed interval until it holds or the timeout elapses
#[derive(Clone, Debug)]
pub struct Poller<C = TokioClock> {
    clock: C,
    interval: Duration,
    timeout: Duration,
}

impl Poller<TokioClock> {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self::with_clock(TokioClock, interval, timeout)
    }
}

impl<C: Clock> Poller<C> {
    pub fn with_clock(clock: C, interval: Duration, timeout: Duration) -> Self {
        Self {
            clock,
            interval,
            timeout,
        }
    }

    /// Run `check` until it returns `Ok(true)`.
    ///
    /// The check runs once immediately and then after every interval. An
    /// error from `check` ends the wait at once. When the timeout passes
    /// without success the result is [`Error::Timeout`] carrying `what`.
    pub async fn poll_until<F, Fut>(&self, what: impl Into<String>, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let start = self.clock.now();
        loop {
            if check().await? {
                return Ok(());
            }
            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= self.timeout {
                return Err(Error::Timeout {
                    what: what.into(),
                    elapsed,
                });
            }
            self.clock.sleep(self.interval).await;
        }
    }
}

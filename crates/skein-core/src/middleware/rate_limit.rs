//! Rate limiting middleware.
//!
//! A sliding window of grant instants: at most `permits` invocations start in
//! any `interval`. One `RateLimiter` is one budget; every handler it wraps
//! draws from the same window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{PipelineError, RunContext, Thread};
use crate::ports::{Handler, Middleware, SharedHandler, Terminal};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    permits: usize,
    interval: Duration,
    window: Arc<Mutex<VecDeque<Instant>>>,
}

impl RateLimiter {
    /// `permits` is clamped to at least one.
    pub fn new(permits: usize, interval: Duration) -> Self {
        let permits = permits.max(1);
        Self {
            permits,
            interval,
            window: Arc::new(Mutex::new(VecDeque::with_capacity(permits))),
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take a slot, waiting for one to free up. Gives up with
    /// `PipelineError::Cancelled` if `ctx` finishes first.
    pub async fn acquire(&self, ctx: &RunContext) -> Result<(), PipelineError> {
        loop {
            ctx.check()?;
            let ready_at = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|granted| now.duration_since(*granted) >= self.interval)
                {
                    window.pop_front();
                }
                if window.len() < self.permits {
                    window.push_back(now);
                    return Ok(());
                }
                match window.front() {
                    Some(oldest) => *oldest + self.interval,
                    None => now,
                }
            };

            debug!(permits = self.permits, "rate limited; waiting for a slot");
            tokio::select! {
                cause = ctx.done() => return Err(PipelineError::Cancelled(cause)),
                _ = tokio::time::sleep_until(ready_at) => {}
            }
        }
    }
}

impl Middleware for RateLimiter {
    fn wrap(&self, inner: SharedHandler) -> SharedHandler {
        Arc::new(Limited {
            inner,
            limiter: self.clone(),
        })
    }

    fn name(&self) -> &str {
        "rate_limit"
    }
}

struct Limited {
    inner: SharedHandler,
    limiter: RateLimiter,
}

#[async_trait]
impl Handler for Limited {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        self.limiter.acquire(thread.ctx()).await?;
        let out = self.inner.handle(thread, &Terminal).await?;
        next.handle(out, &Terminal).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CancelCause;
    use crate::ports::run;
    use crate::testing::{CallLog, RecordingHandler};

    #[tokio::test(start_paused = true)]
    async fn permits_within_interval_pass_without_waiting() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        let ctx = RunContext::new();
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire(&ctx).await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_calls_wait_for_the_window_to_slide() {
        let log = CallLog::new();
        let handler = RateLimiter::new(2, Duration::from_secs(1))
            .wrap(RecordingHandler::shared("h", &log));
        let start = Instant::now();

        for _ in 0..3 {
            run(&handler, Thread::default()).await.unwrap();
        }

        assert_eq!(log.calls().len(), 3);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn wrapped_handlers_share_one_budget() {
        let log = CallLog::new();
        let limiter = RateLimiter::new(1, Duration::from_millis(500));
        let a = limiter.wrap(RecordingHandler::shared("a", &log));
        let b = limiter.wrap(RecordingHandler::shared("b", &log));
        let start = Instant::now();

        run(&a, Thread::default()).await.unwrap();
        run(&b, Thread::default()).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_never_runs() {
        let log = CallLog::new();
        let handler = RateLimiter::new(1, Duration::from_secs(10))
            .wrap(RecordingHandler::shared("h", &log));

        run(&handler, Thread::default()).await.unwrap();
        let ctx = RunContext::new().with_timeout(Duration::from_millis(100));
        let err = run(&handler, Thread::new(ctx)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled(CancelCause::DeadlineExceeded)));
        assert_eq!(log.calls(), vec!["h"]);
    }
}

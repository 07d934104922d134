//! Retry middleware: 失敗した handler を backoff を挟んで再実行する

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::domain::{PipelineError, RunContext, Thread};
use crate::ports::{Handler, Middleware, SharedHandler, Terminal};

/// 次の試行までの待ち時間
#[derive(Clone, Default)]
pub enum Backoff {
    /// すぐに再試行する
    #[default]
    None,
    Constant(Duration),
    /// `step * attempt`.
    Linear(Duration),
    /// `base * multiplier^(attempt - 1)`（上限 `max`）。`jitter` が有効なら
    /// その値の上半分から一様に選ぶ
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Option<Duration>,
        jitter: bool,
    },
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential {
            base,
            multiplier: 2.0,
            max: None,
            jitter: false,
        }
    }

    /// `attempt` 回目（1 始まり）の失敗後の待ち時間
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Constant(delay) => *delay,
            Backoff::Linear(step) => step.saturating_mul(attempt),
            Backoff::Exponential {
                base,
                multiplier,
                max,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let raw = base.as_secs_f64() * multiplier.powi(exponent);
                let cap = max.map_or(f64::MAX, |m| m.as_secs_f64());
                // NaN と負の値は待たない。+inf だけが上限に張り付く
                let mut secs = if raw.is_nan() || raw <= 0.0 { 0.0 } else { raw.min(cap) };
                if *jitter && secs > 0.0 {
                    secs *= rand::thread_rng().gen_range(0.5..=1.0);
                }
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
            Backoff::Custom(f) => f(attempt),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::None => f.write_str("None"),
            Backoff::Constant(d) => f.debug_tuple("Constant").field(d).finish(),
            Backoff::Linear(d) => f.debug_tuple("Linear").field(d).finish(),
            Backoff::Exponential {
                base,
                multiplier,
                max,
                jitter,
            } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("multiplier", multiplier)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            Backoff::Custom(_) => f.write_str("Custom"),
        }
    }
}

pub type RetryPredicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// 試行回数と試行間の待ち時間
#[derive(Clone)]
pub struct RetryPolicy {
    /// 初回を含む総試行回数
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// 再試行するエラーの判定。`None` ならすべて再試行する
    pub retry_if: Option<RetryPredicate>,
    /// 呼び出し側の context が終わったら再試行をやめ、backoff の sleep も中断する
    pub honor_cancellation: bool,
    /// 最後のエラーを `RetryExhausted` で包む（false ならそのまま返す）
    pub report_attempts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::None,
            retry_if: None,
            honor_cancellation: true,
            report_attempts: true,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_if<F>(mut self, pred: F) -> Self
    where
        F: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(pred));
        self
    }

    pub fn honor_cancellation(mut self, honor: bool) -> Self {
        self.honor_cancellation = honor;
        self
    }

    pub fn report_attempts(mut self, report: bool) -> Self {
        self.report_attempts = report;
        self
    }

    fn should_retry(&self, error: &PipelineError) -> bool {
        self.retry_if.as_ref().is_none_or(|pred| pred(error))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retry_if", &self.retry_if.is_some())
            .field("honor_cancellation", &self.honor_cancellation)
            .field("report_attempts", &self.report_attempts)
            .finish()
    }
}

/// [`RetryPolicy`] の middleware 版
///
/// # 例
/// ```ignore
/// let retry = Retry::new(RetryPolicy::default().attempts(5).backoff(Backoff::exponential(base)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Retry {
    policy: Arc<RetryPolicy>,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Middleware for Retry {
    fn wrap(&self, inner: SharedHandler) -> SharedHandler {
        Arc::new(Retrying {
            inner,
            policy: Arc::clone(&self.policy),
        })
    }

    fn name(&self) -> &str {
        "retry"
    }
}

struct Retrying {
    inner: SharedHandler,
    policy: Arc<RetryPolicy>,
}

impl Retrying {
    async fn pause(&self, ctx: &RunContext, delay: Duration) -> Result<(), PipelineError> {
        if delay.is_zero() {
            return Ok(());
        }
        if self.policy.honor_cancellation {
            ctx.guard(tokio::time::sleep(delay)).await
        } else {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

#[async_trait]
impl Handler for Retrying {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let policy = &self.policy;
        let caller = thread.context();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;

        let last = loop {
            attempt += 1;
            if policy.honor_cancellation {
                caller.check()?;
            }
            let input = if policy.honor_cancellation {
                thread.clone()
            } else {
                thread.with_context(RunContext::detached())
            };

            match self.inner.handle(input, &Terminal).await {
                Ok(out) => {
                    if attempt > 1 {
                        debug!(handler = self.inner.name(), attempt, "succeeded after retry");
                    }
                    return next.handle(out.with_context(caller), &Terminal).await;
                }
                Err(e) if policy.honor_cancellation && e.is_cancellation() && caller.is_done() => {
                    return Err(e);
                }
                Err(e) if !policy.should_retry(&e) => return Err(e),
                Err(e) if attempt >= max_attempts => break e,
                Err(e) => {
                    let delay = policy.backoff.delay(attempt);
                    warn!(
                        handler = self.inner.name(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed; retrying"
                    );
                    self.pause(&caller, delay).await?;
                }
            }
        };

        warn!(handler = self.inner.name(), attempts = attempt, error = %last, "retries exhausted");
        if policy.report_attempts {
            Err(PipelineError::RetryExhausted {
                attempts: attempt,
                last: Box::new(last),
            })
        } else {
            Err(last)
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

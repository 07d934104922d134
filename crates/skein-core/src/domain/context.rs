//! キャンセルと deadline の伝搬
//!
//! すべての thread は呼び出し側が用意した `RunContext` を持ちます。
//! Composite はそれをそのまま子へ渡します。並列グループだけは各子に
//! `child()` を渡し、呼び出し側の token に触れずに兄弟をキャンセルできるようにします。
//!
//! # 例
//! ```ignore
//! let ctx = RunContext::new().with_timeout(Duration::from_secs(10));
//! let thread = Thread::new(ctx.clone());
//! // 別タスクから ctx.cancel() すると、実行中の pipeline は Cancelled で終わる
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::errors::PipelineError;

/// context が終了した理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Cancelled => f.write_str("context cancelled"),
            CancelCause::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 呼び出し側のキャンセルも deadline も引き継がない新しい context
    pub fn detached() -> Self {
        Self::default()
    }

    /// 既存の token を包む（サーバーの shutdown 経路が持つ token など）
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// deadline を設定する。既存の deadline の方が早ければそちらを残す
    pub fn with_deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current <= at => current,
            _ => at,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// 派生 context: 親と一緒にキャンセルされ、単独でもキャンセルできる
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 明示的なキャンセルは期限切れより優先される
    pub fn cause(&self) -> Option<CancelCause> {
        if self.token.is_cancelled() {
            return Some(CancelCause::Cancelled);
        }
        match self.deadline {
            Some(at) if Instant::now() >= at => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.cause().is_some()
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        match self.cause() {
            Some(cause) => Err(PipelineError::Cancelled(cause)),
            None => Ok(()),
        }
    }

    /// token が発火するか deadline を過ぎたら完了する
    pub async fn done(&self) -> CancelCause {
        match self.deadline {
            Some(at) => {
                tokio::select! {
                    _ = self.token.cancelled() => CancelCause::Cancelled,
                    _ = tokio::time::sleep_until(at) => CancelCause::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelCause::Cancelled
            }
        }
    }

    /// context が先に終わらなければ `fut` を実行する
    pub async fn guard<F>(&self, fut: F) -> Result<F::Output, PipelineError>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            cause = self.done() => Err(PipelineError::Cancelled(cause)),
            value = fut => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_not_done() {
        let ctx = RunContext::new();
        assert!(!ctx.is_done());
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn cancelling_parent_cancels_child_but_not_reverse() {
        let parent = RunContext::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
        assert!(!sibling.is_done());

        parent.cancel();
        assert_eq!(sibling.cause(), Some(CancelCause::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = RunContext::new().with_timeout(Duration::from_millis(50));
        assert!(!ctx.is_done());

        let cause = ctx.done().await;
        assert_eq!(cause, CancelCause::DeadlineExceeded);
        assert!(matches!(
            ctx.check(),
            Err(PipelineError::Cancelled(CancelCause::DeadlineExceeded))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_only_tightens() {
        let early = Instant::now() + Duration::from_millis(10);
        let late = Instant::now() + Duration::from_secs(10);
        let ctx = RunContext::new().with_deadline(early).with_deadline(late);
        assert_eq!(ctx.deadline(), Some(early));
    }

    #[tokio::test]
    async fn guard_returns_cancelled_when_token_fires() {
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let out = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                7
            })
            .await;
        assert!(matches!(out, Err(PipelineError::Cancelled(CancelCause::Cancelled))));
    }

    #[tokio::test]
    async fn guard_passes_value_through() {
        let out = RunContext::new().guard(async { 42 }).await.unwrap();
        assert_eq!(out, 42);
    }
}

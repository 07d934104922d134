//! Handler / Middleware の契約
//!
//! エンジンの拡張ポイントはこの 2 つの trait だけです。
//! - **Handler**: provider、tool アダプター、すべての composite
//! - **Middleware**: retry、rate limit、logging、validation

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{PipelineError, Thread};

/// thread に対する処理単位
///
/// `next` は後続の handler です。正常に完了した handler は出力を `next` に渡します。
/// [`Terminal`] を渡すとチェーンはそこで終わります。
///
/// # 例
/// ```ignore
/// struct Greet;
///
/// #[async_trait]
/// impl Handler for Greet {
///     async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
///         thread.append_message(Message::assistant("hello"));
///         next.handle(thread, &Terminal).await
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError>;

    /// エラー経路とログで使う名前
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

pub type SharedHandler = Arc<dyn Handler>;

/// 何もしない後続: thread をそのまま返す
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminal;

#[async_trait]
impl Handler for Terminal {
    async fn handle(&self, thread: Thread, _next: &dyn Handler) -> Result<Thread, PipelineError> {
        Ok(thread)
    }

    fn name(&self) -> &str {
        "terminal"
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        (**self).handle(thread, next).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// `handler` を pipeline の最外周として呼び出す
pub async fn run(handler: &dyn Handler, thread: Thread) -> Result<Thread, PipelineError> {
    handler.handle(thread, &Terminal).await
}

/// handler を同じ契約の拡張 handler に変換する
pub trait Middleware: Send + Sync {
    fn wrap(&self, inner: SharedHandler) -> SharedHandler;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

pub type SharedMiddleware = Arc<dyn Middleware>;

impl<F> Middleware for F
where
    F: Fn(SharedHandler) -> SharedHandler + Send + Sync,
{
    fn wrap(&self, inner: SharedHandler) -> SharedHandler {
        self(inner)
    }
}

/// `middleware[0]` が最外周になるように `handler` を包む
///
/// 最初に登録した middleware が最初に入り、最後に出ます。
pub fn apply_middleware(handler: SharedHandler, middleware: &[SharedMiddleware]) -> SharedHandler {
    middleware
        .iter()
        .rev()
        .fold(handler, |inner, mw| mw.wrap(inner))
}

//! Closure ベースの handler

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{PipelineError, Thread};
use crate::ports::{Handler, SharedHandler, Terminal};

/// async closure から作る leaf handler
///
/// closure が新しい thread を返し、handler がそれを `next` に渡します。
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Thread) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Thread, PipelineError>> + Send,
{
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let thread = (self.f)(thread).await?;
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// `Arc::new(FnHandler::new(name, f))` の省略形
///
/// # 例
/// ```ignore
/// let shout = handler_fn("shout", |thread: Thread| async move {
///     thread.append_message(Message::assistant("HELLO"));
///     Ok(thread)
/// });
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> SharedHandler
where
    F: Fn(Thread) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Thread, PipelineError>> + Send + 'static,
{
    Arc::new(FnHandler::new(name, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Message;
    use crate::ports::run;

    #[tokio::test]
    async fn closure_output_is_forwarded_to_next() {
        let first = handler_fn("first", |thread: Thread| async move {
            thread.append_message(Message::assistant("one"));
            Ok(thread)
        });
        let second = handler_fn("second", |thread: Thread| async move {
            thread.append_message(Message::assistant("two"));
            Ok(thread)
        });

        let out = first.handle(Thread::default(), second.as_ref()).await.unwrap();
        let contents: Vec<String> = out.messages().iter().map(|m| m.content().into()).collect();
        assert_eq!(contents, vec!["one", "two"]);
        assert_eq!(first.name(), "first");
    }

    #[tokio::test]
    async fn closure_error_skips_next() {
        let failing = handler_fn("failing", |_thread: Thread| async move {
            Err::<Thread, _>(PipelineError::validation("nope"))
        });
        let err = run(failing.as_ref(), Thread::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}

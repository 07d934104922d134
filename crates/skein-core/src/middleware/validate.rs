//! Precondition checks in front of a handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{PipelineError, Thread};
use crate::ports::{Handler, Middleware, SharedHandler, Terminal};

type Check = dyn Fn(&Thread) -> Result<(), String> + Send + Sync;

/// Rejects the thread with `PipelineError::Validation` before the wrapped
/// handler runs.
#[derive(Clone)]
pub struct Validate {
    name: Arc<str>,
    check: Arc<Check>,
}

impl Validate {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Thread) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            check: Arc::new(check),
        }
    }

    /// The thread must contain at least one message.
    pub fn non_empty() -> Self {
        Self::new("non_empty", |thread| {
            if thread.message_count() == 0 {
                Err("thread has no messages".to_string())
            } else {
                Ok(())
            }
        })
    }

    /// Metadata `key` must be present.
    pub fn requires_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(format!("requires {key}"), move |thread| {
            if thread.get(&key).is_some() {
                Ok(())
            } else {
                Err(format!("missing metadata key '{key}'"))
            }
        })
    }
}

impl Middleware for Validate {
    fn wrap(&self, inner: SharedHandler) -> SharedHandler {
        Arc::new(Validated {
            inner,
            rule: self.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Validated {
    inner: SharedHandler,
    rule: Validate,
}

#[async_trait]
impl Handler for Validated {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        if let Err(reason) = (self.rule.check)(&thread) {
            debug!(rule = %self.rule.name, handler = self.inner.name(), %reason, "validation rejected");
            return Err(PipelineError::validation(format!("{}: {reason}", self.rule.name)));
        }
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
    use crate::domain::{ErrorKind, Message, RunContext};
    use crate::ports::run;
    use crate::testing::{CallLog, RecordingHandler};
    use serde_json::json;

    #[tokio::test]
    async fn rejection_skips_the_wrapped_handler() {
        let log = CallLog::new();
        let handler = Validate::non_empty().wrap(RecordingHandler::shared("h", &log));

        let err = run(&handler, Thread::default()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("thread has no messages"));
        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn passing_check_runs_the_handler() {
        let log = CallLog::new();
        let handler = Validate::non_empty().wrap(RecordingHandler::shared("h", &log));
        let thread = Thread::from_messages(RunContext::new(), vec![Message::user("hi")]);

        let out = run(&handler, thread).await.unwrap();

        assert_eq!(out.message_count(), 2);
        assert_eq!(log.calls(), vec!["h"]);
    }

    #[tokio::test]
    async fn requires_key_names_the_missing_key() {
        let log = CallLog::new();
        let handler = Validate::requires_key("user_id").wrap(RecordingHandler::shared("h", &log));

        let err = run(&handler, Thread::default()).await.unwrap_err();
        assert!(err.to_string().contains("user_id"));

        let thread = Thread::default();
        thread.set("user_id", json!(7));
        assert!(run(&handler, thread).await.is_ok());
    }
}

//! Observability middleware: tracing spans and timing metadata.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

use crate::domain::{PipelineError, Thread};
use crate::ports::{Handler, Middleware, SharedHandler, Terminal};

/// Runs the wrapped handler inside a `handler` span and logs its outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging;

impl Middleware for Logging {
    fn wrap(&self, inner: SharedHandler) -> SharedHandler {
        Arc::new(Logged { inner })
    }

    fn name(&self) -> &str {
        "logging"
    }
}

struct Logged {
    inner: SharedHandler,
}

#[async_trait]
impl Handler for Logged {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let span = info_span!("handler", handler = self.inner.name(), thread = %thread.id());
        let started = Instant::now();
        let result = self
            .inner
            .handle(thread, &Terminal)
            .instrument(span.clone())
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        span.in_scope(|| match &result {
            Ok(out) => debug!(elapsed_ms, messages = out.message_count(), "handler ok"),
            Err(e) => warn!(elapsed_ms, kind = ?e.kind(), error = %e, "handler failed"),
        });
        next.handle(result?, &Terminal).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Writes the wrapped handler's elapsed milliseconds under `key`.
#[derive(Debug, Clone)]
pub struct Timing {
    key: Arc<str>,
}

impl Timing {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Arc::from(key.into()),
        }
    }
}

impl Middleware for Timing {
    fn wrap(&self, inner: SharedHandler) -> SharedHandler {
        Arc::new(Timed {
            inner,
            key: Arc::clone(&self.key),
        })
    }

    fn name(&self) -> &str {
        "timing"
    }
}

struct Timed {
    inner: SharedHandler,
    key: Arc<str>,
}

#[async_trait]
impl Handler for Timed {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let started = Instant::now();
        let out = self.inner.handle(thread, &Terminal).await?;
        out.set(self.key.as_ref(), json!(started.elapsed().as_millis() as u64));
        next.handle(out, &Terminal).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::run;
    use crate::testing::{CallLog, FailingHandler, RecordingHandler};
    use crate::typed::handler_fn;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn timing_records_elapsed_millis() {
        let slow = handler_fn("slow", |t: Thread| async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(t)
        });
        let handler = Timing::new("latency_ms").wrap(slow);

        let out = run(&handler, Thread::default()).await.unwrap();

        let elapsed = out.get("latency_ms").and_then(|v| v.as_u64()).unwrap();
        assert!((250..260).contains(&elapsed), "elapsed {elapsed}");
    }

    #[tokio::test]
    async fn logging_is_transparent() {
        let log = CallLog::new();
        let ok = Logging.wrap(RecordingHandler::shared("h", &log));
        let out = run(&ok, Thread::default()).await.unwrap();
        assert_eq!(out.message_count(), 1);
        assert_eq!(Handler::name(ok.as_ref()), "h");

        let failing = Logging.wrap(FailingHandler::shared("f", &log));
        assert!(run(&failing, Thread::default()).await.is_err());
        assert_eq!(log.calls(), vec!["h", "f"]);
    }
}

//! Cycle: 固定の handler 列をラウンドロビンで繰り返す

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{OnError, ThreadPredicate, check_loop};
use crate::domain::{AggregateError, ChildFailure, PipelineError, Thread};
use crate::ports::{Handler, SharedHandler, Terminal};

/// `handlers` を順に呼び出し、最後まで行ったら先頭に戻る
///
/// 1 反復 = 1 回の handler 呼び出しなので、`[a, b]` を 5 反復すると
/// `a b a b a` になります。`iterations` がなければ、`until` かキャンセル
/// （`PipelineError::Cancelled`）でしか終わりません。
pub struct Cycle {
    name: String,
    handlers: Vec<SharedHandler>,
    iterations: Option<usize>,
    until: Option<ThreadPredicate>,
    on_error: OnError,
}

impl Cycle {
    pub fn new(name: impl Into<String>, handlers: Vec<SharedHandler>) -> Self {
        Self {
            name: name.into(),
            handlers,
            iterations: None,
            until: None,
            on_error: OnError::Stop,
        }
    }

    pub fn iterations(mut self, n: usize) -> Self {
        self.iterations = Some(n);
        self
    }

    /// `pred` が成り立ったら次の呼び出しの前で止まる
    pub fn until<F>(mut self, pred: F) -> Self
    where
        F: Fn(&Thread) -> bool + Send + Sync + 'static,
    {
        self.until = Some(Arc::new(pred));
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }
}

#[async_trait]
impl Handler for Cycle {
    async fn handle(&self, mut thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        if self.handlers.is_empty() {
            return next.handle(thread, &Terminal).await;
        }

        let mut failures = Vec::new();
        let mut step = 0usize;
        loop {
            if self.iterations.is_some_and(|n| step >= n) {
                break;
            }
            check_loop(&thread, &self.name, step, &mut failures)?;
            if self.until.as_ref().is_some_and(|pred| pred(&thread)) {
                debug!(cycle = %self.name, step, "stop condition met");
                break;
            }

            let handler = &self.handlers[step % self.handlers.len()];
            debug!(cycle = %self.name, step, handler = handler.name(), "cycle step");
            match handler.handle(thread.clone(), &Terminal).await {
                Ok(out) => thread = out,
                Err(e) => match self.on_error {
                    OnError::Stop => return Err(e.within(handler.name())),
                    OnError::Collect => {
                        warn!(cycle = %self.name, step, handler = handler.name(), error = %e, "cycle step failed");
                        failures.push(ChildFailure {
                            index: step,
                            name: handler.name().to_string(),
                            error: e,
                        });
                    }
                },
            }
            step += 1;
        }

        if !failures.is_empty() {
            return Err(AggregateError::new(self.name.clone(), failures).into());
        }
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CancelCause, RunContext};
    use crate::ports::run;
    use crate::testing::{CallLog, FailingHandler, RecordingHandler};
    use std::time::Duration;

    #[tokio::test]
    async fn alternates_handlers_for_exact_iteration_count() {
        let log = CallLog::new();
        let cycle = Cycle::new(
            "debate",
            vec![
                RecordingHandler::shared("A", &log),
                RecordingHandler::shared("B", &log),
            ],
        )
        .iterations(5);

        let out = run(&cycle, Thread::default()).await.unwrap();

        assert_eq!(log.calls(), vec!["A", "B", "A", "B", "A"]);
        assert_eq!(out.message_count(), 5);
    }

    #[tokio::test]
    async fn until_predicate_ends_cycle() {
        let log = CallLog::new();
        let cycle = Cycle::new("chat", vec![RecordingHandler::shared("A", &log)])
            .until(|t: &Thread| t.message_count() >= 3);

        let out = run(&cycle, Thread::default()).await.unwrap();
        assert_eq!(out.message_count(), 3);
    }

    #[tokio::test]
    async fn first_failure_stops_by_default() {
        let log = CallLog::new();
        let cycle = Cycle::new(
            "c",
            vec![
                RecordingHandler::shared("A", &log),
                FailingHandler::shared("B", &log),
            ],
        )
        .iterations(6);

        let err = run(&cycle, Thread::default()).await.unwrap_err();
        assert_eq!(log.calls(), vec!["A", "B"]);
        assert_eq!(err.handler_path(), vec!["B"]);
    }

    #[tokio::test]
    async fn collect_keeps_going_and_reports_every_failure() {
        let log = CallLog::new();
        let cycle = Cycle::new(
            "c",
            vec![
                RecordingHandler::shared("A", &log),
                FailingHandler::shared("B", &log),
            ],
        )
        .iterations(4)
        .on_error(OnError::Collect);

        let err = run(&cycle, Thread::default()).await.unwrap_err();

        assert_eq!(log.calls(), vec!["A", "B", "A", "B"]);
        let PipelineError::Aggregate(agg) = err else {
            panic!("expected aggregate");
        };
        let steps: Vec<usize> = agg.failures.iter().map(|f| f.index).collect();
        assert_eq!(steps, vec![1, 3]);
    }

    #[tokio::test]
    async fn unbounded_cycle_stops_on_cancellation() {
        let log = CallLog::new();
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let slow = crate::typed::handler_fn("tick", |t: Thread| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(t)
        });
        let cycle = Cycle::new("forever", vec![slow, RecordingHandler::shared("A", &log)]);

        let err = run(&cycle, Thread::new(ctx)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled(CancelCause::Cancelled)));
        assert!(!log.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn collected_failures_survive_a_deadline() {
        let log = CallLog::new();
        let tick = crate::typed::handler_fn("tick", |t: Thread| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(t)
        });
        let cycle = Cycle::new("c", vec![FailingHandler::shared("B", &log), tick])
            .on_error(OnError::Collect);
        let ctx = RunContext::new().with_timeout(Duration::from_millis(40));

        let err = run(&cycle, Thread::new(ctx)).await.unwrap_err();

        let PipelineError::Aggregate(agg) = err else {
            panic!("expected aggregate");
        };
        let (last, earlier) = agg.failures.split_last().unwrap();
        assert_eq!(earlier.len(), log.calls().len());
        assert!(!earlier.is_empty());
        assert!(earlier.iter().all(|f| f.name == "B"));
        assert!(matches!(last.error, PipelineError::Cancelled(CancelCause::DeadlineExceeded)));
    }
}

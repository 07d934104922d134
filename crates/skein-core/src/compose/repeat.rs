//! For: repeat one handler a fixed number of times or until a predicate holds.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use super::{OnError, ThreadPredicate, check_loop, restore_keys};
use crate::domain::{AggregateError, ChildFailure, PipelineError, Thread};
use crate::ports::{Handler, SharedHandler, Terminal};

/// Metadata key holding the zero-based iteration index while `For` runs.
pub const ITERATION_KEY: &str = "skein.iteration";

/// Each iteration runs on a derived copy of the current thread with
/// [`ITERATION_KEY`] set; the handler's output feeds the next iteration.
/// `until` is checked before every iteration. With neither `times` nor
/// `until` the loop ends only through cancellation.
pub struct For {
    name: String,
    handler: SharedHandler,
    times: Option<usize>,
    until: Option<ThreadPredicate>,
    on_error: OnError,
}

impl For {
    pub fn new(name: impl Into<String>, handler: SharedHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            times: None,
            until: None,
            on_error: OnError::Stop,
        }
    }

    pub fn times(mut self, n: usize) -> Self {
        self.times = Some(n);
        self
    }

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
impl Handler for For {
    async fn handle(&self, mut thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let saved = thread.get(ITERATION_KEY);
        let mut failures = Vec::new();
        let mut iteration = 0usize;

        loop {
            if self.times.is_some_and(|n| iteration >= n) {
                break;
            }
            check_loop(&thread, &self.name, iteration, &mut failures)?;
            if self.until.as_ref().is_some_and(|pred| pred(&thread)) {
                debug!(repeat = %self.name, iteration, "stop condition met");
                break;
            }

            let scoped = thread.clone();
            scoped.set(ITERATION_KEY, json!(iteration));
            match self.handler.handle(scoped, &Terminal).await {
                Ok(out) => thread = out,
                Err(e) => match self.on_error {
                    OnError::Stop => return Err(e.within(self.handler.name())),
                    OnError::Collect => {
                        warn!(repeat = %self.name, iteration, error = %e, "iteration failed");
                        failures.push(ChildFailure {
                            index: iteration,
                            name: self.handler.name().to_string(),
                            error: e,
                        });
                    }
                },
            }
            iteration += 1;
        }

        if !failures.is_empty() {
            return Err(AggregateError::new(self.name.clone(), failures).into());
        }
        restore_keys(&thread, vec![(ITERATION_KEY, saved)]);
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CancelCause, Message, RunContext};
    use crate::ports::run;
    use crate::testing::{CallLog, FailingHandler, RecordingHandler};
    use crate::typed::handler_fn;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn repeats_fixed_number_of_times() {
        let log = CallLog::new();
        let repeat = For::new("thrice", RecordingHandler::shared("h", &log)).times(3);

        let out = run(&repeat, Thread::default()).await.unwrap();

        assert_eq!(log.calls(), vec!["h", "h", "h"]);
        assert_eq!(out.message_count(), 3);
    }

    #[tokio::test]
    async fn injects_iteration_index_and_removes_it_afterwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            handler_fn("seen", move |t: Thread| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(t.get(ITERATION_KEY));
                    Ok(t)
                }
            })
        };

        let out = run(&For::new("f", recorder).times(3), Thread::default())
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![Some(json!(0)), Some(json!(1)), Some(json!(2))]);
        assert_eq!(out.get(ITERATION_KEY), None);
    }

    #[tokio::test]
    async fn until_is_checked_before_each_iteration() {
        let log = CallLog::new();
        let repeat = For::new("grow", RecordingHandler::shared("h", &log))
            .until(|t: &Thread| t.message_count() >= 2);

        let out = run(&repeat, Thread::default()).await.unwrap();
        assert_eq!(out.message_count(), 2);

        let already_done = Thread::from_messages(
            RunContext::new(),
            vec![Message::user("1"), Message::user("2")],
        );
        log.clear();
        run(&repeat, already_done).await.unwrap();
        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn fail_fast_by_default() {
        let log = CallLog::new();
        let repeat = For::new("f", FailingHandler::shared("boom", &log)).times(3);

        let err = run(&repeat, Thread::default()).await.unwrap_err();
        assert_eq!(log.calls(), vec!["boom"]);
        assert_eq!(err.handler_path(), vec!["boom"]);
    }

    #[tokio::test]
    async fn unbounded_loop_is_stoppable() {
        let ctx = RunContext::new().with_timeout(Duration::from_millis(30));
        let tick = handler_fn("tick", |t: Thread| async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(t)
        });

        let err = run(&For::new("forever", tick), Thread::new(ctx))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(CancelCause::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn collected_failures_survive_a_deadline() {
        let flaky = handler_fn("flaky", |_t: Thread| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err::<Thread, _>(PipelineError::upstream("flaky"))
        });
        let repeat = For::new("forever", flaky).on_error(OnError::Collect);
        let ctx = RunContext::new().with_timeout(Duration::from_millis(40));

        let err = run(&repeat, Thread::new(ctx)).await.unwrap_err();

        let PipelineError::Aggregate(agg) = err else {
            panic!("expected aggregate");
        };
        let (last, earlier) = agg.failures.split_last().unwrap();
        assert!(!earlier.is_empty());
        assert!(earlier.iter().all(|f| f.name == "flaky"));
        assert_eq!(last.index, earlier.len());
        assert!(matches!(last.error, PipelineError::Cancelled(CancelCause::DeadlineExceeded)));
    }
}

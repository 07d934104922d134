//! Range: run a handler once per value of a caller-supplied list.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{OnError, check_loop, restore_keys};
use crate::domain::{AggregateError, ChildFailure, PipelineError, Thread};
use crate::ports::{Handler, SharedHandler, SharedMiddleware, Terminal, apply_middleware};

/// Metadata key holding the current value while `Range` runs.
pub const RANGE_VALUE_KEY: &str = "skein.range.value";
/// Metadata key holding the current zero-based position while `Range` runs.
pub const RANGE_INDEX_KEY: &str = "skein.range.index";

/// Both keys are written into a derived copy of the thread before each
/// invocation and restored to their pre-loop state in the returned thread.
pub struct Range {
    name: String,
    handler: SharedHandler,
    values: Vec<Value>,
    middleware: Vec<SharedMiddleware>,
    on_error: OnError,
}

impl Range {
    pub fn new<I, V>(name: impl Into<String>, handler: SharedHandler, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            name: name.into(),
            handler,
            values: values.into_iter().map(Into::into).collect(),
            middleware: Vec::new(),
            on_error: OnError::Stop,
        }
    }

    /// Middleware applied identically to every iteration.
    pub fn with_middleware(mut self, middleware: SharedMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

#[async_trait]
impl Handler for Range {
    async fn handle(&self, mut thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let saved = vec![
            (RANGE_VALUE_KEY, thread.get(RANGE_VALUE_KEY)),
            (RANGE_INDEX_KEY, thread.get(RANGE_INDEX_KEY)),
        ];
        let handler = apply_middleware(std::sync::Arc::clone(&self.handler), &self.middleware);
        let mut failures = Vec::new();

        for (index, value) in self.values.iter().enumerate() {
            check_loop(&thread, &self.name, index, &mut failures)?;
            debug!(range = %self.name, index, %value, "range iteration");

            let scoped = thread.clone();
            scoped.set(RANGE_VALUE_KEY, value.clone());
            scoped.set(RANGE_INDEX_KEY, json!(index));
            match handler.handle(scoped, &Terminal).await {
                Ok(out) => thread = out,
                Err(e) => match self.on_error {
                    OnError::Stop => return Err(e.within(self.handler.name())),
                    OnError::Collect => {
                        warn!(range = %self.name, index, error = %e, "range iteration failed");
                        failures.push(ChildFailure {
                            index,
                            name: self.handler.name().to_string(),
                            error: e,
                        });
                    }
                },
            }
        }

        if !failures.is_empty() {
            return Err(AggregateError::new(self.name.clone(), failures).into());
        }
        restore_keys(&thread, saved);
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

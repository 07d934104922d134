//! 逐次チェーン

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{PipelineError, Thread};
use crate::ports::{Handler, SharedHandler, SharedMiddleware, Terminal, apply_middleware};

/// 名前付き stage: （middleware で包まれているかもしれない）handler と、
/// 元になった handler の名前
#[derive(Clone)]
pub(crate) struct Stage {
    pub(crate) name: String,
    pub(crate) handler: SharedHandler,
}

impl Stage {
    pub(crate) fn new(handler: SharedHandler, middleware: &[SharedMiddleware]) -> Self {
        let name = handler.name().to_string();
        Self {
            name,
            handler: apply_middleware(handler, middleware),
        }
    }
}

/// stage を厳密に順番に実行し、前の出力を次に渡す。
/// 最初の失敗で中断し、失敗した stage の名前で包む。
pub(crate) async fn run_stages(
    group: &str,
    stages: &[Stage],
    mut thread: Thread,
) -> Result<Thread, PipelineError> {
    for (index, stage) in stages.iter().enumerate() {
        thread.ctx().check()?;
        debug!(group, stage = %stage.name, index, thread = %thread.id(), "stage start");
        thread = stage
            .handler
            .handle(thread, &Terminal)
            .await
            .map_err(|e| e.within(stage.name.as_str()))?;
    }
    Ok(thread)
}

/// handler を登録順に実行する
///
/// [`Sequential::with_middleware`] で追加した middleware はすべての stage を包みます。
pub struct Sequential {
    name: String,
    handlers: Vec<SharedHandler>,
    middleware: Vec<SharedMiddleware>,
}

impl Sequential {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
            middleware: Vec::new(),
        }
    }

    pub fn then(mut self, handler: SharedHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_middleware(mut self, middleware: SharedMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn stages(&self) -> Vec<Stage> {
        self.handlers
            .iter()
            .map(|h| Stage::new(Arc::clone(h), &self.middleware))
            .collect()
    }
}

#[async_trait]
impl Handler for Sequential {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let thread = run_stages(&self.name, &self.stages(), thread).await?;
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

//! Flow: レキシカルスコープ付き middleware を持つ逐次チェーン
//!
//! # 例
//! ```ignore
//! let flow = Flow::builder("answer")
//!     .with_middleware(Arc::new(Logging))              // 全 stage
//!     .stage(validate_input)
//!     .scope(|s| s.with(Arc::new(Retry::default()))    // この 2 つだけ
//!         .stage(provider)
//!         .stage(tools))
//!     .stage(validate_output)
//!     .build();
//! ```
//!
//! グローバル middleware が最外周、その内側に外側から順にスコープの middleware が
//! 重なります。スコープは stage の実行順序を変えません。

use async_trait::async_trait;

use super::sequential::{Stage, run_stages};
use crate::domain::{PipelineError, Thread};
use crate::ports::{Handler, SharedHandler, SharedMiddleware, Terminal};

pub struct Flow {
    name: String,
    stages: Vec<Stage>,
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder {
            name: name.into(),
            global: Vec::new(),
            root: Scope::default(),
        }
    }

    /// 実行順の stage 名
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

#[async_trait]
impl Handler for Flow {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let thread = run_stages(&self.name, &self.stages, thread).await?;
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

enum Entry {
    Stage(SharedHandler),
    Scope(Scope),
}

/// middleware を共有する stage のレキシカルなグループ
#[derive(Default)]
pub struct Scope {
    middleware: Vec<SharedMiddleware>,
    entries: Vec<Entry>,
}

impl Scope {
    /// このスコープのすべての stage に掛かる middleware（宣言位置に関係なく）
    pub fn with(mut self, middleware: SharedMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn stage(mut self, handler: SharedHandler) -> Self {
        self.entries.push(Entry::Stage(handler));
        self
    }

    pub fn scope(mut self, build: impl FnOnce(Scope) -> Scope) -> Self {
        self.entries.push(Entry::Scope(build(Scope::default())));
        self
    }

    fn flatten(self, inherited: &[SharedMiddleware], out: &mut Vec<Stage>) {
        let mut chain = inherited.to_vec();
        chain.extend(self.middleware);
        for entry in self.entries {
            match entry {
                Entry::Stage(handler) => out.push(Stage::new(handler, &chain)),
                Entry::Scope(inner) => inner.flatten(&chain, out),
            }
        }
    }
}

pub struct FlowBuilder {
    name: String,
    global: Vec<SharedMiddleware>,
    root: Scope,
}

impl FlowBuilder {
    /// flow の全 stage に掛かる middleware
    pub fn with_middleware(mut self, middleware: SharedMiddleware) -> Self {
        self.global.push(middleware);
        self
    }

    pub fn stage(mut self, handler: SharedHandler) -> Self {
        self.root = self.root.stage(handler);
        self
    }

    pub fn scope(mut self, build: impl FnOnce(Scope) -> Scope) -> Self {
        self.root = self.root.scope(build);
        self
    }

    pub fn build(self) -> Flow {
        let mut stages = Vec::new();
        self.root.flatten(&self.global, &mut stages);
        Flow {
            name: self.name,
            stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::run;
    use crate::testing::{CallLog, RecordingHandler, tagging_middleware};

    #[tokio::test]
    async fn scopes_keep_registration_order() {
        let log = CallLog::new();
        let flow = Flow::builder("flow")
            .stage(RecordingHandler::shared("a", &log))
            .scope(|s| s.stage(RecordingHandler::shared("b", &log)))
            .stage(RecordingHandler::shared("c", &log))
            .build();

        run(&flow, Thread::default()).await.unwrap();

        assert_eq!(log.calls(), vec!["a", "b", "c"]);
        assert_eq!(flow.stage_names(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn scope_middleware_applies_only_inside_scope() {
        let log = CallLog::new();
        let flow = Flow::builder("flow")
            .with_middleware(tagging_middleware("g", &log))
            .stage(RecordingHandler::shared("validate", &log))
            .scope(|s| {
                s.with(tagging_middleware("retry", &log))
                    .stage(RecordingHandler::shared("work", &log))
                    .scope(|inner| {
                        inner
                            .with(tagging_middleware("inner", &log))
                            .stage(RecordingHandler::shared("deep", &log))
                    })
            })
            .build();

        run(&flow, Thread::default()).await.unwrap();

        assert_eq!(
            log.calls(),
            vec![
                "g>", "validate", "<g",
                "g>", "retry>", "work", "<retry", "<g",
                "g>", "retry>", "inner>", "deep", "<inner", "<retry", "<g",
            ]
        );
    }

    #[tokio::test]
    async fn scope_middleware_declared_after_stage_still_applies() {
        let log = CallLog::new();
        let flow = Flow::builder("flow")
            .scope(|s| {
                s.stage(RecordingHandler::shared("work", &log))
                    .with(tagging_middleware("late", &log))
            })
            .build();

        run(&flow, Thread::default()).await.unwrap();
        assert_eq!(log.calls(), vec!["late>", "work", "<late"]);
    }
}

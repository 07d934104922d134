use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use skein_core::PipelineConfig;
use skein_core::compose::{Condition, First, Flow, Switch};
use skein_core::domain::{Message, PipelineError, Role, RunContext, Thread, ToolCall};
use skein_core::impls::{ToolDispatch, ToolRegistry};
use skein_core::middleware::{Logging, Retry, Timing, Validate};
use skein_core::ports::{Handler, SharedHandler, SharedMiddleware, Terminal, run};
use skein_core::testing::FakeProvider;
use skein_core::typed::TypedTool;

#[derive(Debug, Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

struct Add;

#[async_trait]
impl TypedTool for Add {
    const NAME: &'static str = "add";
    type Args = AddArgs;
    type Output = i64;

    fn description(&self) -> &str {
        "adds two integers"
    }

    async fn call(&self, args: AddArgs) -> Result<i64, PipelineError> {
        args.a
            .checked_add(args.b)
            .ok_or_else(|| PipelineError::validation("add: overflow"))
    }
}

/// classify：最新の user メッセージから intent を推定して metadata に書く
struct Classify;

#[async_trait]
impl Handler for Classify {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let is_math = thread
            .messages()
            .iter()
            .rev()
            .find(|m| m.role() == Role::User)
            .is_some_and(|m| m.content().chars().any(|c| c.is_ascii_digit()));
        thread.set("intent", json!(if is_math { "math" } else { "chat" }));
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        "classify"
    }
}

fn math_flow(config: &PipelineConfig) -> Result<SharedHandler, PipelineError> {
    let mut registry = ToolRegistry::new();
    registry.register_typed(Add)?;

    // planner は 1 回目だけ失敗する（retry スコープの動作確認用）
    let planner = FakeProvider::new("planner")
        .fail("model overloaded")
        .call_tools(vec![ToolCall::new("call-1", "add", r#"{"a": 2, "b": 40}"#)]);

    let answer = First::new("answer")
        .add(Arc::new(FakeProvider::new("primary").reply("2 + 40 = 42")))
        .add(Arc::new(FakeProvider::new("backup").reply("42")))
        .drain_grace(config.parallel.drain_grace());

    let retry: SharedMiddleware = Arc::new(Retry::new(config.retry.to_policy()));
    let rate_limit: Option<SharedMiddleware> = config
        .rate_limit
        .as_ref()
        .map(|rl| Arc::new(rl.build()) as SharedMiddleware);

    let flow = Flow::builder("math")
        .scope(|s| {
            let s = s.with(retry);
            let s = match rate_limit {
                Some(limiter) => s.with(limiter),
                None => s,
            };
            s.stage(Arc::new(planner))
        })
        .stage(Arc::new(ToolDispatch::new(Arc::new(registry))))
        .scope(|s| {
            s.with(Arc::new(Timing::new("answer_ms")))
                .stage(Arc::new(answer))
        })
        .build();
    Ok(Arc::new(flow))
}

fn pipeline(config: &PipelineConfig) -> Result<Flow, PipelineError> {
    let chat: SharedHandler = Arc::new(FakeProvider::new("chat").reply("Hello there."));
    let route = Switch::new("route", chat).case(
        Condition::metadata_equals("intent", "math"),
        math_flow(config)?,
    );

    Ok(Flow::builder("assistant")
        .with_middleware(Arc::new(Logging))
        .scope(|s| {
            s.with(Arc::new(Validate::non_empty()))
                .stage(Arc::new(Classify))
        })
        .stage(Arc::new(route))
        .build())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // (A) tracing を初期化（RUST_LOG がなければ info）
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    // (B) 設定を読む（引数がなければデフォルト）
    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_path(path)?,
        None => PipelineConfig::default(),
    };
    tracing::info!(?config, "configuration loaded");

    // (C) pipeline を組み立て、10 秒の deadline 付きで実行
    let pipeline = pipeline(&config)?;
    let ctx = RunContext::new().with_timeout(Duration::from_secs(10));
    let thread = Thread::from_messages(ctx, vec![Message::user("What is 2 + 40?")]);

    match run(&pipeline, thread).await {
        Ok(out) => {
            println!("{}", serde_json::to_string_pretty(&out.snapshot())?);
            Ok(())
        }
        Err(e) => {
            tracing::error!(kind = ?e.kind(), path = ?e.handler_path(), "pipeline failed");
            Err(e.into())
        }
    }
}

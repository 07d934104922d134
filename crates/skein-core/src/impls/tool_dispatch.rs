//! Tool dispatch: 最新メッセージの tool 呼び出しに応答する

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::{Message, PipelineError, Thread};
use crate::ports::{Handler, Terminal, ToolLookup};

/// 最新メッセージの tool 呼び出しを順に実行し、call id で紐づいた
/// `Role::Tool` の結果を追加します。
///
/// 最新メッセージに tool 呼び出しがなければ、thread はそのまま通過します。
/// tool の出力が UTF-8 でなければ upstream エラーになります。
pub struct ToolDispatch {
    tools: Arc<dyn ToolLookup>,
}

impl ToolDispatch {
    pub fn new(tools: Arc<dyn ToolLookup>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl Handler for ToolDispatch {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let calls = thread
            .last_message()
            .map(|m| m.tool_calls().to_vec())
            .unwrap_or_default();
        if calls.is_empty() {
            return next.handle(thread, &Terminal).await;
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            thread.ctx().check()?;
            let Some(tool) = self.tools.lookup(&call.name) else {
                warn!(tool = %call.name, call_id = %call.id, "unknown tool");
                return Err(PipelineError::ToolNotFound(call.name.clone()));
            };
            debug!(tool = %call.name, call_id = %call.id, "invoking tool");
            let output = tool
                .invoke(call.arguments.as_bytes())
                .await
                .map_err(|e| e.within(call.name.as_str()))?;
            let content = String::from_utf8(output).map_err(|e| {
                PipelineError::upstream(format!("tool output is not UTF-8: {e}"))
                    .within(call.name.as_str())
            })?;
            results.push(Message::tool_result(call.id.as_str(), call.name.as_str(), content));
        }

        thread.append_messages(results);
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        "tool_dispatch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, Role, RunContext, ToolCall};
    use crate::impls::ToolRegistry;
    use crate::ports::run;
    use crate::testing::FakeTool;

    fn dispatch_with(tools: Vec<FakeTool>) -> ToolDispatch {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::new(tool)).unwrap();
        }
        ToolDispatch::new(Arc::new(registry))
    }

    fn asking(calls: Vec<ToolCall>) -> Thread {
        Thread::from_messages(
            RunContext::new(),
            vec![
                Message::user("what's the weather?"),
                Message::assistant("").with_tool_calls(calls),
            ],
        )
    }

    #[tokio::test]
    async fn appends_one_result_per_call_in_order() {
        let weather = FakeTool::new("weather", r#"{"temp":21}"#);
        let seen = weather.calls();
        let dispatch = dispatch_with(vec![weather, FakeTool::new("time", "\"12:00\"")]);

        let thread = asking(vec![
            ToolCall::new("c1", "weather", r#"{"city":"Oslo"}"#),
            ToolCall::new("c2", "time", "{}"),
        ]);
        let out = run(&dispatch, thread).await.unwrap();

        let messages = out.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role(), Role::Tool);
        assert_eq!(messages[2].tool_call_id(), Some("c1"));
        assert_eq!(messages[2].name(), Some("weather"));
        assert_eq!(messages[2].content(), r#"{"temp":21}"#);
        assert_eq!(messages[3].tool_call_id(), Some("c2"));
        assert_eq!(seen.lock().clone(), vec![br#"{"city":"Oslo"}"#.to_vec()]);
    }

    #[tokio::test]
    async fn unknown_tool_fails() {
        let dispatch = dispatch_with(vec![]);
        let err = run(&dispatch, asking(vec![ToolCall::new("c1", "nope", "{}")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
    }

    #[tokio::test]
    async fn no_tool_calls_passes_through() {
        let dispatch = dispatch_with(vec![]);
        let thread = Thread::from_messages(RunContext::new(), vec![Message::user("hi")]);
        let out = run(&dispatch, thread).await.unwrap();
        assert_eq!(out.message_count(), 1);
    }

    #[tokio::test]
    async fn tool_errors_name_the_tool() {
        let dispatch = dispatch_with(vec![FakeTool::failing("weather")]);
        let err = run(&dispatch, asking(vec![ToolCall::new("c1", "weather", "{}")]))
            .await
            .unwrap_err();
        assert_eq!(err.handler_path(), vec!["weather"]);
    }

    #[tokio::test]
    async fn non_utf8_output_is_an_error() {
        let dispatch = dispatch_with(vec![FakeTool::new("blob", vec![0xff, 0xfe, b'A'])]);
        let err = run(&dispatch, asking(vec![ToolCall::new("c1", "blob", "{}")]))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert_eq!(err.handler_path(), vec!["blob"]);
        assert!(err.to_string().contains("not UTF-8"));
    }
}

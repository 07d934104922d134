//! テスト・デモ用の fake 実装
//!
//! 本物の provider や tool なしで pipeline を動かすためのものです。
//! すべて決定的で、状態は各インスタンスが持ちます（プロセス全体の状態はありません）。

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{Message, PipelineError, Thread, ToolCall};
use crate::ports::{Handler, SharedHandler, SharedMiddleware, Terminal, Tool};

/// 実行されたものの共有・順序付きの記録
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// 名前を記録し、名前入りの assistant メッセージを追加して後続に渡す
pub struct RecordingHandler {
    name: String,
    log: CallLog,
}

impl RecordingHandler {
    pub fn new(name: impl Into<String>, log: &CallLog) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
        }
    }

    pub fn shared(name: impl Into<String>, log: &CallLog) -> SharedHandler {
        Arc::new(Self::new(name, log))
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        self.log.record(self.name.as_str());
        thread.append_message(Message::assistant(self.name.as_str()));
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 名前を記録し、upstream エラーで失敗する
pub struct FailingHandler {
    name: String,
    log: CallLog,
}

impl FailingHandler {
    pub fn new(name: impl Into<String>, log: &CallLog) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
        }
    }

    pub fn shared(name: impl Into<String>, log: &CallLog) -> SharedHandler {
        Arc::new(Self::new(name, log))
    }
}

#[async_trait]
impl Handler for FailingHandler {
    async fn handle(&self, _thread: Thread, _next: &dyn Handler) -> Result<Thread, PipelineError> {
        self.log.record(self.name.as_str());
        Err(PipelineError::upstream(format!("{} failed", self.name)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// `delay` だけ sleep する。先に thread の context が終われば、
/// キャンセルされたことを記録する
pub struct SlowHandler {
    name: String,
    delay: Duration,
    log: CallLog,
    cancelled: AtomicBool,
}

impl SlowHandler {
    pub fn new(name: impl Into<String>, delay: Duration, log: &CallLog) -> Self {
        Self {
            name: name.into(),
            delay,
            log: log.clone(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for SlowHandler {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        self.log.record(format!("{} start", self.name));
        if let Err(e) = thread.ctx().guard(tokio::time::sleep(self.delay)).await {
            self.cancelled.store(true, Ordering::SeqCst);
            self.log.record(format!("{} cancelled", self.name));
            return Err(e);
        }
        thread.append_message(Message::assistant(self.name.as_str()));
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 入るときに `"{tag}>"`、出るときに `"<{tag}"` を記録する middleware
pub fn tagging_middleware(tag: &str, log: &CallLog) -> SharedMiddleware {
    let tag = tag.to_string();
    let log = log.clone();
    Arc::new(move |inner: SharedHandler| -> SharedHandler {
        Arc::new(Tagged {
            tag: tag.clone(),
            log: log.clone(),
            inner,
        })
    })
}

struct Tagged {
    tag: String,
    log: CallLog,
    inner: SharedHandler,
}

#[async_trait]
impl Handler for Tagged {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        self.log.record(format!("{}>", self.tag));
        let result = self.inner.handle(thread, &Terminal).await;
        self.log.record(format!("<{}", self.tag));
        next.handle(result?, &Terminal).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

enum Reply {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    Fail(String),
}

/// スクリプト駆動の model provider
///
/// 呼び出しごとに次の応答を取り出し、assistant メッセージとして追加します。
/// スクリプトを使い切ると upstream エラーになります。
pub struct FakeProvider {
    name: String,
    script: Mutex<VecDeque<Reply>>,
    invocations: AtomicUsize,
}

impl FakeProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.script.lock().push_back(Reply::Text(text.into()));
        self
    }

    /// `calls` を要求する assistant メッセージ
    pub fn call_tools(self, calls: Vec<ToolCall>) -> Self {
        self.script.lock().push_back(Reply::ToolCalls(calls));
        self
    }

    /// 一時的な失敗（他の応答と同じく 1 回で消費される）
    pub fn fail(self, message: impl Into<String>) -> Self {
        self.script.lock().push_back(Reply::Fail(message.into()));
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for FakeProvider {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        thread.ctx().check()?;
        let reply = self.script.lock().pop_front();
        let message = match reply {
            Some(Reply::Text(text)) => Message::assistant(text),
            Some(Reply::ToolCalls(calls)) => Message::assistant("").with_tool_calls(calls),
            Some(Reply::Fail(message)) => return Err(PipelineError::upstream(message)),
            None => {
                return Err(PipelineError::upstream(format!(
                    "{}: no scripted reply left",
                    self.name
                )));
            }
        };
        thread.append_message(message.with_name(self.name.as_str()));
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 固定のペイロードを返し、受け取った引数を覚えておく tool
pub struct FakeTool {
    name: String,
    reply: Option<Vec<u8>>,
    calls: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeTool {
    pub fn new(name: impl Into<String>, reply: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            reply: Some(reply.into()),
            calls: Arc::default(),
        }
    }

    /// 毎回失敗する tool
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reply: None,
            calls: Arc::default(),
        }
    }

    /// これまでに受け取った引数ペイロード
    pub fn calls(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Tool for FakeTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test tool"
    }

    async fn invoke(&self, args: &[u8]) -> Result<Vec<u8>, PipelineError> {
        self.calls.lock().push(args.to_vec());
        self.reply
            .clone()
            .ok_or_else(|| PipelineError::upstream(format!("{} is unavailable", self.name)))
    }
}

//! 並列グループ: `First`（race）と `Must`（join）
//!
//! 子は入力 thread の独立したコピー上で spawn されたタスクとして動き、
//! それぞれが自分の child token を持ちます。実行順序は不定ですが、
//! 結果とエラーは常に登録順で報告されます。
//!
//! ## 子タスクの後始末
//! グループは子を置き去りにしません。終了条件に達した時点で残りの子の token を
//! まとめてキャンセルし、drain grace を過ぎてもキャンセルに応じない子は abort します。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::domain::{
    AggregateError, CancelCause, ChildFailure, MergeOptions, Metadata, PipelineError, RunContext,
    Thread,
};
use crate::ports::{Handler, SharedHandler, Terminal};

pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(1000);

/// グループ内の子 1 つの終わり方
#[derive(Debug)]
pub enum ChildStatus {
    Succeeded(Thread),
    Failed(PipelineError),
    /// 自分の結果を出す前にグループによってキャンセルされた
    Cancelled,
}

/// グループ実行における子ごとの記録
#[derive(Debug)]
pub struct ChildOutcome {
    pub index: usize,
    pub name: String,
    /// 完了順での位置。グループが待つのをやめた子は `None`
    pub completion: Option<usize>,
    pub status: ChildStatus,
}

impl ChildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ChildStatus::Succeeded(_))
    }
}

type AggregateFn = dyn Fn(&Thread, Vec<Thread>) -> Result<Thread, PipelineError> + Send + Sync;

/// `Must` の成功した子を 1 つの thread にまとめる
#[derive(Clone)]
pub struct Aggregator {
    inner: AggregatorKind,
}

#[derive(Clone)]
enum AggregatorKind {
    Merge(MergeOptions),
    Custom(Arc<AggregateFn>),
}

impl Aggregator {
    /// 入力から始め、登録順に各子の新しいメッセージを追加し、
    /// 子が変更した metadata キーをマージする
    pub fn merge(options: impl Into<MergeOptions>) -> Self {
        Self {
            inner: AggregatorKind::Merge(options.into()),
        }
    }

    /// `f(input, children)` は子の thread を登録順に受け取る
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Thread, Vec<Thread>) -> Result<Thread, PipelineError> + Send + Sync + 'static,
    {
        Self {
            inner: AggregatorKind::Custom(Arc::new(f)),
        }
    }

    pub fn apply(&self, input: &Thread, children: Vec<Thread>) -> Result<Thread, PipelineError> {
        match &self.inner {
            AggregatorKind::Custom(f) => f(input, children),
            AggregatorKind::Merge(options) => {
                let out = input.clone();
                let base = input.message_count();
                let original = input.metadata();
                for child in children {
                    out.append_messages(child.messages().into_iter().skip(base));
                    let written: Metadata = child
                        .metadata()
                        .iter()
                        .filter(|(key, value)| original.get(key.as_str()) != Some(*value))
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect();
                    out.merge_metadata(&written, options);
                }
                Ok(out)
            }
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::merge(MergeOptions::default())
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            AggregatorKind::Merge(options) => f.debug_tuple("Merge").field(options).finish(),
            AggregatorKind::Custom(_) => f.write_str("Custom"),
        }
    }
}

type ChildResult = Result<Thread, PipelineError>;

enum Event {
    Settled(usize),
    Exhausted,
    CallerDone(CancelCause),
}

/// 1 回のグループ実行で spawn した子
struct Group<'a> {
    name: &'a str,
    children: &'a [SharedHandler],
    tasks: JoinSet<ChildResult>,
    by_task: HashMap<TaskId, usize>,
    contexts: Vec<RunContext>,
    outcomes: Vec<Option<ChildOutcome>>,
    cancelled_by_group: HashSet<usize>,
    completed: usize,
}

impl<'a> Group<'a> {
    fn launch(name: &'a str, children: &'a [SharedHandler], thread: &Thread) -> Self {
        let mut tasks = JoinSet::new();
        let mut by_task = HashMap::with_capacity(children.len());
        let mut contexts = Vec::with_capacity(children.len());

        for (index, child) in children.iter().enumerate() {
            let ctx = thread.ctx().child();
            let scoped = thread.with_context(ctx.clone());
            let child = Arc::clone(child);
            let handle = tasks.spawn(async move { child.handle(scoped, &Terminal).await });
            by_task.insert(handle.id(), index);
            contexts.push(ctx);
        }
        debug!(group = name, children = children.len(), "group launched");

        Self {
            name,
            children,
            tasks,
            by_task,
            contexts,
            outcomes: (0..children.len()).map(|_| None).collect(),
            cancelled_by_group: HashSet::new(),
            completed: 0,
        }
    }

    /// 次に決着した子を待って記録し、その index を返す
    async fn settle_next(&mut self) -> Option<usize> {
        let joined = self.tasks.join_next_with_id().await?;
        let (task, status) = match joined {
            Ok((task, Ok(thread))) => (task, ChildStatus::Succeeded(thread)),
            Ok((task, Err(error))) => (task, ChildStatus::Failed(error)),
            Err(error) => (error.id(), self.join_failure(error)),
        };
        let index = *self.by_task.get(&task)?;
        let status = match status {
            ChildStatus::Failed(error)
                if error.is_cancellation() && self.cancelled_by_group.contains(&index) =>
            {
                ChildStatus::Cancelled
            }
            other => other,
        };
        debug!(group = self.name, child = index, completion = self.completed, "child settled");
        self.outcomes[index] = Some(ChildOutcome {
            index,
            name: self.children[index].name().to_string(),
            completion: Some(self.completed),
            status,
        });
        self.completed += 1;
        Some(index)
    }

    /// 次に決着した子（呼び出し側の context が先に終われば CallerDone）
    async fn next_event(&mut self, caller: &RunContext) -> Event {
        tokio::select! {
            biased;
            settled = self.settle_next() => match settled {
                Some(index) => Event::Settled(index),
                None => Event::Exhausted,
            },
            cause = caller.done() => Event::CallerDone(cause),
        }
    }

    fn join_failure(&self, error: JoinError) -> ChildStatus {
        if error.is_cancelled() {
            ChildStatus::Cancelled
        } else {
            ChildStatus::Failed(PipelineError::upstream(format!("child task panicked: {error}")))
        }
    }

    /// まだ決着していない子をすべてキャンセルする
    fn cancel_pending(&mut self) {
        for (index, ctx) in self.contexts.iter().enumerate() {
            if self.outcomes[index].is_none() {
                self.cancelled_by_group.insert(index);
                ctx.cancel();
            }
        }
    }

    fn last_status(&self, index: usize) -> Option<&ChildStatus> {
        self.outcomes[index].as_ref().map(|o| &o.status)
    }

    /// 残りの子を待ち、`grace` を過ぎたら abort する
    async fn drain(&mut self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, self.settle_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!(group = self.name, remaining = self.tasks.len(), "children ignored cancellation; aborting");
                    self.tasks.abort_all();
                    while self.settle_next().await.is_some() {}
                    break;
                }
            }
        }
    }

    /// 実行中の子をバックグラウンドの drain タスクに引き渡す
    fn reap(self, grace: Duration) -> Vec<ChildOutcome> {
        let Group {
            name,
            children,
            mut tasks,
            outcomes,
            ..
        } = self;
        if !tasks.is_empty() {
            let group = name.to_string();
            tokio::spawn(async move {
                let drained = tokio::time::timeout(grace, async {
                    while tasks.join_next().await.is_some() {}
                })
                .await;
                if drained.is_err() {
                    warn!(group = %group, remaining = tasks.len(), "children ignored cancellation; aborting");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                }
            });
        }
        finish_outcomes(children, outcomes)
    }

    fn into_outcomes(self) -> Vec<ChildOutcome> {
        finish_outcomes(self.children, self.outcomes)
    }
}

fn finish_outcomes(
    children: &[SharedHandler],
    outcomes: Vec<Option<ChildOutcome>>,
) -> Vec<ChildOutcome> {
    outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| {
            outcome.unwrap_or_else(|| ChildOutcome {
                index,
                name: children[index].name().to_string(),
                completion: None,
                status: ChildStatus::Cancelled,
            })
        })
        .collect()
}

fn collect_failures(outcomes: &mut [ChildOutcome]) -> Vec<ChildFailure> {
    outcomes
        .iter_mut()
        .filter_map(|outcome| {
            if !matches!(outcome.status, ChildStatus::Failed(_)) {
                return None;
            }
            let status = std::mem::replace(&mut outcome.status, ChildStatus::Cancelled);
            let ChildStatus::Failed(error) = status else {
                return None;
            };
            Some(ChildFailure {
                index: outcome.index,
                name: outcome.name.clone(),
                error,
            })
        })
        .collect()
}

/// Race: 最初に成功した子が勝つ
///
/// 勝者が決まった時点で残りはキャンセルされます。
/// すべての子が失敗した場合は、全失敗の aggregate を返します。
///
/// # 例
/// ```ignore
/// let answer = First::new("answer")
///     .add(primary)
///     .add(backup)
///     .drain_grace(Duration::from_millis(200));
/// ```
pub struct First {
    name: String,
    children: Vec<SharedHandler>,
    drain_grace: Duration,
}

impl First {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn add(mut self, handler: SharedHandler) -> Self {
        self.children.push(handler);
        self
    }

    /// キャンセルされた敗者が abort されるまでに許される猶予
    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// race を実行し、結果と一緒にすべての子の outcome を返す
    pub async fn race(&self, thread: Thread) -> (Result<Thread, PipelineError>, Vec<ChildOutcome>) {
        if self.children.is_empty() {
            let err = PipelineError::validation(format!("race '{}' has no children", self.name));
            return (Err(err), Vec::new());
        }
        if let Err(e) = thread.ctx().check() {
            return (Err(e), Vec::new());
        }

        let mut group = Group::launch(&self.name, &self.children, &thread);
        let mut winner = None;
        loop {
            match group.next_event(thread.ctx()).await {
                Event::Settled(index) => {
                    if matches!(group.last_status(index), Some(ChildStatus::Succeeded(_))) {
                        winner = Some(index);
                        break;
                    }
                }
                Event::Exhausted => break,
                Event::CallerDone(cause) => {
                    group.cancel_pending();
                    let outcomes = group.reap(self.drain_grace);
                    return (Err(PipelineError::Cancelled(cause)), outcomes);
                }
            }
        }

        let Some(winner) = winner else {
            let mut outcomes = group.into_outcomes();
            if let Err(e) = thread.ctx().check() {
                return (Err(e), outcomes);
            }
            let failures = collect_failures(&mut outcomes);
            warn!(group = %self.name, failed = failures.len(), "every child failed");
            return (Err(AggregateError::new(self.name.clone(), failures).into()), outcomes);
        };

        group.cancel_pending();
        info!(group = %self.name, winner, "race won");
        let outcomes = group.reap(self.drain_grace);
        let out = match &outcomes[winner].status {
            ChildStatus::Succeeded(out) => out.with_context(thread.context()),
            _ => return (Err(PipelineError::validation("race winner lost its result")), outcomes),
        };
        (Ok(out), outcomes)
    }
}

#[async_trait]
impl Handler for First {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let (result, _) = self.race(thread).await;
        next.handle(result?, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Join: すべての子が成功しなければならない
///
/// 最初の失敗で残りの子をキャンセルしますが、すべての子が決着するまで待ってから
/// 失敗の aggregate を返します。失敗がなければ、成功した子を [`Aggregator`] で
/// まとめます。
pub struct Must {
    name: String,
    children: Vec<SharedHandler>,
    aggregator: Aggregator,
    drain_grace: Duration,
}

impl Must {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            aggregator: Aggregator::default(),
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn add(mut self, handler: SharedHandler) -> Self {
        self.children.push(handler);
        self
    }

    pub fn aggregate(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub async fn join(&self, thread: Thread) -> (Result<Thread, PipelineError>, Vec<ChildOutcome>) {
        if let Err(e) = thread.ctx().check() {
            return (Err(e), Vec::new());
        }

        let mut group = Group::launch(&self.name, &self.children, &thread);
        loop {
            match group.next_event(thread.ctx()).await {
                Event::Settled(index) => {
                    if matches!(group.last_status(index), Some(ChildStatus::Failed(_))) {
                        debug!(group = %self.name, child = index, "child failed; cancelling siblings");
                        group.cancel_pending();
                        group.drain(self.drain_grace).await;
                        break;
                    }
                }
                Event::Exhausted => break,
                Event::CallerDone(cause) => {
                    group.cancel_pending();
                    group.drain(self.drain_grace).await;
                    return (Err(PipelineError::Cancelled(cause)), group.into_outcomes());
                }
            }
        }
        let mut outcomes = group.into_outcomes();

        if let Err(e) = thread.ctx().check() {
            return (Err(e), outcomes);
        }
        let failures = collect_failures(&mut outcomes);
        if !failures.is_empty() {
            warn!(group = %self.name, failed = failures.len(), "join failed");
            return (Err(AggregateError::new(self.name.clone(), failures).into()), outcomes);
        }

        let threads = outcomes
            .iter()
            .filter_map(|o| match &o.status {
                ChildStatus::Succeeded(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        let result = self
            .aggregator
            .apply(&thread, threads)
            .map(|out| out.with_context(thread.context()));
        info!(group = %self.name, children = outcomes.len(), "join complete");
        (result, outcomes)
    }
}

#[async_trait]
impl Handler for Must {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        let (result, _) = self.join(thread).await;
        next.handle(result?, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

//! Switch: 最初に一致した条件で分岐を 1 つだけ選ぶ

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::domain::{PipelineError, Role, Thread};
use crate::ports::{Handler, SharedHandler, Terminal};

/// thread の内容と metadata に対する純粋な述語
#[derive(Clone)]
pub struct Condition {
    label: String,
    pred: Arc<dyn Fn(&Thread) -> bool + Send + Sync>,
}

impl Condition {
    pub fn from_fn<F>(label: impl Into<String>, pred: F) -> Self
    where
        F: Fn(&Thread) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            pred: Arc::new(pred),
        }
    }

    /// metadata の `key` が存在し、`value` と等しい
    pub fn metadata_equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        let label = format!("{key} == {value}");
        Self::from_fn(label, move |thread| thread.get(&key).as_ref() == Some(&value))
    }

    pub fn has_key(key: impl Into<String>) -> Self {
        let key = key.into();
        let label = format!("has {key}");
        Self::from_fn(label, move |thread| thread.get(&key).is_some())
    }

    /// 最新メッセージの発信者が `role`（別名は正規化して比較）
    pub fn last_role_is(role: Role) -> Self {
        Self::from_fn(format!("last role {role}"), move |thread| {
            thread
                .last_message()
                .is_some_and(|m| m.role().canonical() == role.canonical())
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn matches(&self, thread: &Thread) -> bool {
        (self.pred)(thread)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condition").field(&self.label).finish()
    }
}

pub struct Switch {
    name: String,
    cases: Vec<(Condition, SharedHandler)>,
    default: SharedHandler,
}

impl Switch {
    /// switch は必ず default 分岐を持つ
    pub fn new(name: impl Into<String>, default: SharedHandler) -> Self {
        Self {
            name: name.into(),
            cases: Vec::new(),
            default,
        }
    }

    pub fn case(mut self, condition: Condition, handler: SharedHandler) -> Self {
        self.cases.push((condition, handler));
        self
    }

    /// thread の振り分け先 handler
    pub fn select(&self, thread: &Thread) -> &SharedHandler {
        self.cases
            .iter()
            .find(|(condition, _)| condition.matches(thread))
            .map(|(_, handler)| handler)
            .unwrap_or(&self.default)
    }
}

#[async_trait]
impl Handler for Switch {
    async fn handle(&self, thread: Thread, next: &dyn Handler) -> Result<Thread, PipelineError> {
        thread.ctx().check()?;
        let branch = self.select(&thread);
        debug!(switch = %self.name, branch = branch.name(), "branch selected");
        let thread = branch
            .handle(thread, &Terminal)
            .await
            .map_err(|e| e.within(branch.name()))?;
        next.handle(thread, &Terminal).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

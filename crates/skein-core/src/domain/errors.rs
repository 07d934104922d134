//! Pipeline 実行時のエラー型
//!
//! Leaf handler はエラーをそのまま返します。Composite は子のエラーを子の名前で
//! 包む（`PipelineError::Handler`）ので、最終的なエラーは handler tree 上の
//! 経路として読めます。

use std::fmt;

use thiserror::Error;

use super::context::CancelCause;

/// 大まかな分類（retry の判定やログで使う）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Upstream,
    RetryExhausted,
    Aggregate,
    Cancelled,
    ToolNotFound,
    Config,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// handler への不正な入力
    #[error("validation failed: {0}")]
    Validation(String),

    /// provider や tool など外部協調者からの失敗
    #[error("upstream error: {source}")]
    Upstream {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("handler '{name}' failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<PipelineError>,
    },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("cancelled: {0}")]
    Cancelled(CancelCause),

    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn upstream<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        PipelineError::Upstream {
            source: error.into(),
        }
    }

    /// `self` を `name` という handler の失敗として包む
    pub fn within(self, name: impl Into<String>) -> Self {
        PipelineError::Handler {
            name: name.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Upstream { .. } => ErrorKind::Upstream,
            PipelineError::Handler { source, .. } => source.kind(),
            PipelineError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            PipelineError::Aggregate(_) => ErrorKind::Aggregate,
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
            PipelineError::ToolNotFound(_) => ErrorKind::ToolNotFound,
            PipelineError::DuplicateTool(_) | PipelineError::Config(_) => ErrorKind::Config,
        }
    }

    /// handler / retry のラッパーを剥がした最も内側のエラー
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::Handler { source, .. } => source.root(),
            PipelineError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), PipelineError::Cancelled(_))
    }

    /// このエラーが通過した handler 名（外側から順に）
    pub fn handler_path(&self) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = self;
        loop {
            match current {
                PipelineError::Handler { name, source } => {
                    path.push(name.as_str());
                    current = source;
                }
                PipelineError::RetryExhausted { last, .. } => current = last,
                _ => return path,
            }
        }
    }

    /// retry ループから出てきたエラーなら試行回数
    pub fn attempts(&self) -> Option<u32> {
        match self {
            PipelineError::RetryExhausted { attempts, .. } => Some(*attempts),
            PipelineError::Handler { source, .. } => source.attempts(),
            _ => None,
        }
    }
}

/// 並列グループ、または Collect モードのループで失敗した 1 件
#[derive(Debug)]
pub struct ChildFailure {
    /// 登録順の index（ループでは反復 index）
    pub index: usize,
    pub name: String,
    pub error: PipelineError,
}

/// グループ内の全失敗（登録順）
#[derive(Debug, Default)]
pub struct AggregateError {
    pub group: String,
    pub failures: Vec<ChildFailure>,
}

impl AggregateError {
    pub fn new(group: impl Into<String>, failures: Vec<ChildFailure>) -> Self {
        Self {
            group: group.into(),
            failures,
        }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of '{}' failed", self.failures.len(), self.group)?;
        for failure in &self.failures {
            write!(f, "; [{}] {}: {}", failure.index, failure.name, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

//! Composite handler
//!
//! 各 composite 自身も `Handler` で、戦略に従って子 handler を組み合わせます。
//!
//! # モジュール構成
//! - **逐次実行**: Sequential, Flow, Cycle, For, Range, Switch（登録順に 1 つずつ）
//! - **並列実行**: First（race）, Must（join）

pub mod cycle;
pub mod flow;
pub mod parallel;
pub mod range;
pub mod repeat;
pub mod sequential;
pub mod switch;

use std::sync::Arc;

use serde_json::Value;

use crate::domain::{AggregateError, ChildFailure, PipelineError, Thread};

pub use self::cycle::Cycle;
pub use self::flow::{Flow, FlowBuilder, Scope};
pub use self::parallel::{Aggregator, ChildOutcome, ChildStatus, First, Must};
pub use self::range::{RANGE_INDEX_KEY, RANGE_VALUE_KEY, Range};
pub use self::repeat::{For, ITERATION_KEY};
pub use self::sequential::Sequential;
pub use self::switch::{Condition, Switch};

/// thread に対する純粋な述語
pub type ThreadPredicate = Arc<dyn Fn(&Thread) -> bool + Send + Sync>;

/// 反復が失敗したときのループの振る舞い
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnError {
    /// 最初の失敗をすぐに返す
    #[default]
    Stop,
    /// 直前の成功した thread から続行し、最後にすべての失敗を報告する
    Collect,
}

/// スコープ付きのキーを書いたループの後で `saved` の値を戻す
pub(crate) fn restore_keys(thread: &Thread, saved: Vec<(&str, Option<Value>)>) {
    for (key, value) in saved {
        match value {
            Some(value) => thread.set(key, value),
            None => {
                thread.remove(key);
            }
        }
    }
}

/// ループ用のキャンセル確認
///
/// `OnError::Collect` で失敗が溜まっている場合、キャンセルを最後の失敗として
/// 追加し、全体を 1 つの aggregate として返します。
pub(crate) fn check_loop(
    thread: &Thread,
    name: &str,
    index: usize,
    failures: &mut Vec<ChildFailure>,
) -> Result<(), PipelineError> {
    let Err(cancelled) = thread.ctx().check() else {
        return Ok(());
    };
    if failures.is_empty() {
        return Err(cancelled);
    }
    failures.push(ChildFailure {
        index,
        name: name.to_string(),
        error: cancelled,
    });
    Err(AggregateError::new(name, std::mem::take(failures)).into())
}

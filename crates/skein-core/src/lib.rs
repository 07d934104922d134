//! skein-core
//!
//! Composition engine for request-processing pipelines over a shared
//! conversational thread.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（thread, message, metadata のマージ, run context, errors）
//! - **ports**: 抽象化レイヤー（Handler / Middleware, Tool / ToolLookup）
//! - **typed**: 型付き API（closure handler, JSON で型付けした tool）
//! - **compose**: Composite（Sequential, Flow, Cycle, For, Range, Switch, First, Must）
//! - **middleware**: Retry, RateLimiter, Logging, Timing, Validate
//! - **impls**: 実装（tool registry, tool dispatch）
//! - **config**: JSON の pipeline 設定
//! - **testing**: テスト・デモ用の決定的な fake
//!
//! ライブラリは `tracing` のイベントを出すだけです。subscriber の設定はバイナリ側で行います。

pub mod compose;
pub mod config;
pub mod domain;
pub mod impls;
pub mod middleware;
pub mod ports;
pub mod testing;
pub mod typed;

pub use crate::compose::{
    Aggregator, Condition, Cycle, First, Flow, For, Must, OnError, Range, Sequential, Switch,
};
pub use crate::config::PipelineConfig;
pub use crate::domain::{
    MergeStrategy, Message, Metadata, PipelineError, Role, RunContext, Thread, ThreadId,
};
pub use crate::middleware::{Backoff, Logging, RateLimiter, Retry, RetryPolicy, Timing, Validate};
pub use crate::ports::{Handler, Middleware, SharedHandler, SharedMiddleware, Terminal, run};

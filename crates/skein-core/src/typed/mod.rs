//! 型付き API（バイト列 / dyn レベルの port へのアダプター）
//!
//! - **handler_fn**: async closure → `Handler`
//! - **TypedTool + JsonTool**: serde で型付けした tool → バイト列レベルの `Tool`

pub mod handler;
pub mod tool;

pub use self::handler::{FnHandler, handler_fn};
pub use self::tool::{JsonTool, TypedTool};

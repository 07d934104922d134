//! 抽象化レイヤー（ports）
//!
//! - **Handler / Middleware**: thread に対する処理単位とそのラッパー
//! - **Tool / ToolLookup**: バイト列レベルの tool 実行と名前解決

pub mod handler;
pub mod tool;

pub use self::handler::{
    Handler, Middleware, SharedHandler, SharedMiddleware, Terminal, apply_middleware, run,
};
pub use self::tool::{Tool, ToolLookup};

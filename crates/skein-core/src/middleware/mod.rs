//! Middleware: handler の変換
//!
//! どのラッパーも内側の handler を `Terminal` 付きで呼び、結果を自分の後続に渡します。
//! そのため内側を再実行（retry）しても、後続が再実行されることはありません。
//!
//! # モジュール構成
//! - **retry**: Retry, RetryPolicy, Backoff
//! - **rate_limit**: RateLimiter（スライディングウィンドウ）
//! - **logging**: Logging, Timing
//! - **validate**: Validate

pub mod logging;
pub mod rate_limit;
pub mod retry;
pub mod validate;

pub use self::logging::{Logging, Timing};
pub use self::rate_limit::RateLimiter;
pub use self::retry::{Backoff, Retry, RetryPolicy, RetryPredicate};
pub use self::validate::Validate;

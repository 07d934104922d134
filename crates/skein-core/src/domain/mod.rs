//! ドメインモデル（thread, message, metadata, ids, context, errors）

pub mod context;
pub mod errors;
pub mod ids;
pub mod message;
pub mod metadata;
pub mod thread;

pub use self::context::{CancelCause, RunContext};
pub use self::errors::{AggregateError, ChildFailure, ErrorKind, PipelineError};
pub use self::ids::{Id, IdMarker, ThreadId};
pub use self::message::{Message, Role, ToolCall};
pub use self::metadata::{MergeFn, MergeOptions, MergeStrategy, Metadata, combine};
pub use self::thread::{Thread, ThreadSnapshot};

//! 実装（tool port のデフォルト実装）

pub mod tool_dispatch;
pub mod tool_registry;

pub use self::tool_dispatch::ToolDispatch;
pub use self::tool_registry::{ToolInfo, ToolRegistry};

//! Tool port
//!
//! Tool は handler より単純な契約です（バイト列を受け取り、バイト列を返す）。
//! エンジンは [`ToolLookup`] 経由でしか tool に触れないので、dispatch の裏には
//! 任意の registry を置けます。

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::PipelineError;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// バイト列の引数で tool を実行する
    async fn invoke(&self, args: &[u8]) -> Result<Vec<u8>, PipelineError>;
}

/// 名前による検索（dispatch が registry に求めるのはこれだけ）
pub trait ToolLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>>;
}

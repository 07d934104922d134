//! 型付き tool
//!
//! `TypedTool` を実装すると、具体的な引数型・出力型で tool を書けます。
//! `JsonTool<T>` は JSON のデコード / エンコードで型を消し、
//! バイト列レベルの [`Tool`] port に合わせます。

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::PipelineError;
use crate::ports::Tool;

/// 型付き tool の trait
///
/// # 例
/// ```ignore
/// #[derive(Deserialize)]
/// struct AddArgs { a: i64, b: i64 }
///
/// struct Add;
///
/// #[async_trait]
/// impl TypedTool for Add {
///     const NAME: &'static str = "add";
///     type Args = AddArgs;
///     type Output = i64;
///
///     async fn call(&self, args: AddArgs) -> Result<i64, PipelineError> {
///         Ok(args.a + args.b)
///     }
/// }
///
/// registry.register(Arc::new(JsonTool::new(Add)))?;
/// ```
#[async_trait]
pub trait TypedTool: Send + Sync + 'static {
    const NAME: &'static str;

    type Args: DeserializeOwned + Send;
    type Output: Serialize + Send;

    fn description(&self) -> &str {
        ""
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, PipelineError>;
}

pub struct JsonTool<T: TypedTool> {
    tool: T,
    _marker: PhantomData<fn() -> T::Args>,
}

impl<T: TypedTool> JsonTool<T> {
    pub fn new(tool: T) -> Self {
        Self {
            tool,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TypedTool> Tool for JsonTool<T> {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> &str {
        self.tool.description()
    }

    async fn invoke(&self, args: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let args: T::Args = serde_json::from_slice(args).map_err(|e| {
            PipelineError::validation(format!("{}: invalid arguments: {e}", T::NAME))
        })?;
        let output = self.tool.call(args).await?;
        serde_json::to_vec(&output).map_err(PipelineError::upstream)
    }
}

//! インメモリの tool registry

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::domain::PipelineError;
use crate::ports::{Tool, ToolLookup};
use crate::typed::{JsonTool, TypedTool};

/// 登録済み tool の名前と説明
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// 名前をキーにした tool の集合
///
/// 起動時に `&mut` で組み立て、その後は [`ToolLookup`] として `Arc` 越しに共有します。
///
/// # 例
/// ```ignore
/// let mut registry = ToolRegistry::new();
/// registry.register_typed(Add)?;
/// let dispatch = ToolDispatch::new(Arc::new(registry));
/// ```
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), PipelineError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(PipelineError::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// [`TypedTool`] を JSON アダプター経由で登録する
    pub fn register_typed<T: TypedTool>(&mut self, tool: T) -> Result<(), PipelineError> {
        self.register(Arc::new(JsonTool::new(tool)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// 登録済み tool の一覧（名前順）
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|tool| ToolInfo {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolLookup for ToolRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTool;

    #[test]
    fn register_then_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FakeTool::new("search", "[]"))).unwrap();

        assert!(registry.lookup("search").is_some());
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FakeTool::new("search", "a"))).unwrap();

        let err = registry
            .register(Arc::new(FakeTool::new("search", "b")))
            .unwrap_err();

        assert!(matches!(err, PipelineError::DuplicateTool(name) if name == "search"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_is_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        for name in ["weather", "calc", "search"] {
            registry.register(Arc::new(FakeTool::new(name, ""))).unwrap();
        }

        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["calc", "search", "weather"]);
    }

    #[test]
    fn empty_registry() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
    }
}

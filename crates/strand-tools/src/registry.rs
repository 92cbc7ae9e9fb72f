use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use strand_core::error::{Result, StrandError};
use strand_core::traits::{Tool, ToolHandle, ToolResolver};
use strand_core::types::{ToolDefinition, ToolPermissions};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replaced previously registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn handle(&self, name: &str) -> Result<ToolHandle> {
        self.get(name)
            .map(ToolHandle::new)
            .ok_or_else(|| StrandError::ToolNotFound(name.to_string()))
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .filter_map(|n| self.handle(n).ok())
            .map(|h| h.definition())
            .collect()
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::clock::CurrentTimeTool);
        registry.register(crate::builtin::json::JsonExtractTool);
        registry.register(crate::builtin::http::HttpGetTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolResolver for ToolRegistry {
    fn resolve_tools(
        &self,
        allow_list: Option<&[String]>,
        permissions: &ToolPermissions,
    ) -> Vec<ToolHandle> {
        if let Some(allowed) = allow_list {
            for name in allowed {
                if !self.tools.contains_key(name) {
                    warn!(tool = %name, "Allow-listed tool is not registered");
                }
            }
        }

        let handles: Vec<ToolHandle> = self
            .list()
            .into_iter()
            .filter(|name| allow_list.map_or(true, |allowed| allowed.iter().any(|a| a == name)))
            .filter(|name| permissions.allows(name))
            .filter_map(|name| self.handle(name).ok())
            .collect();

        debug!(count = handles.len(), "Resolved tools");
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_test_utils::CountingTool;

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(CountingTool::new("search"));
        reg.register(CountingTool::new("shell"));
        reg.register(CountingTool::new("weather"));
        reg
    }

    fn names(handles: &[ToolHandle]) -> Vec<&str> {
        handles.iter().map(|h| h.name()).collect()
    }

    #[test]
    fn resolve_without_restrictions_returns_all() {
        let handles = registry().resolve_tools(None, &ToolPermissions::All);
        assert_eq!(names(&handles), vec!["search", "shell", "weather"]);
    }

    #[test]
    fn resolve_intersects_allow_list_and_permissions() {
        let allow = vec!["search".to_string(), "shell".to_string(), "missing".to_string()];
        let perms = ToolPermissions::only(["search", "weather"]);
        let handles = registry().resolve_tools(Some(&allow), &perms);
        assert_eq!(names(&handles), vec!["search"]);
    }

    #[test]
    fn empty_allow_list_resolves_nothing() {
        let handles = registry().resolve_tools(Some(&[]), &ToolPermissions::All);
        assert!(handles.is_empty());
    }

    #[test]
    fn builtins_are_registered() {
        let reg = ToolRegistry::with_builtins();
        assert_eq!(reg.list(), vec!["current_time", "http_get", "json_extract"]);
        assert!(matches!(reg.handle("nope"), Err(StrandError::ToolNotFound(_))));
    }
}

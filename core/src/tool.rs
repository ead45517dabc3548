//! The dynamic tool-dispatch seam shared by worker sessions and the main
//! agent loop: a tagged registry of `{name, description, parameter schema,
//! execute}` rather than an inheritance hierarchy.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Capability level an [`ApprovalGate`](crate::approval::ApprovalGate) checks
/// before an elevated tool is allowed to run unattended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Safe,
    Elevated,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    fn capability(&self) -> Capability {
        Capability::Safe
    }
    async fn call(&self, args: &str) -> anyhow::Result<String>;
}

/// Name -> tool map. Cheap to clone (the handles inside are `Arc`d); a fresh
/// registry is built per session so that worker-scoped tool sets never leak
/// into the main agent's.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<crate::llm::chat::ToolDefinition> {
        self.tools
            .values()
            .map(|t| crate::llm::chat::ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }
}

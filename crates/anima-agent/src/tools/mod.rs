pub mod memory_query;
pub mod web;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::provider::ToolDefinition;

/// Broad grouping for diagnostics and selective registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    Web,
    Memory,
    Other,
}

/// Outcome of one tool handler. Handlers never raise — failures come back
/// as `is_error` results the model can react to.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A `ToolResult` paired with the tool_use id it answers.
#[derive(Debug, Clone)]
pub struct ExecutedTool {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// A named tool the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    fn category(&self) -> ToolCategory;

    async fn execute(&self, input: Value) -> ToolResult;
}

/// Registry of available tools; the executor the tool loop calls into.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas for the LLM request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a named tool. Unknown names produce an error result rather
    /// than failing the turn.
    pub async fn execute(&self, tool_use_id: &str, name: &str, input: Value) -> ExecutedTool {
        let result = match self.get(name) {
            Some(tool) => {
                debug!(tool = name, "executing tool");
                tool.execute(input).await
            }
            None => ToolResult::error(format!("unknown tool: {name}")),
        };
        ExecutedTool {
            tool_use_id: tool_use_id.to_string(),
            content: result.content,
            is_error: result.is_error,
        }
    }
}

//! Tool trait — the abstraction over agent capabilities.
//!
//! Concrete tools (shell, file access, search) live outside the engine. The
//! loop only sees this trait, the registry that names tools, and the
//! [`ToolResult`] they hand back.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthRequest;
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Parameters as a JSON object
    pub parameters: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters,
        }
    }
}

/// The result of a tool execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Output payload
    #[serde(default)]
    pub value: serde_json::Value,

    /// Error text; empty means success
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// The loop must ask a human before this call may run
    #[serde(default)]
    pub requires_user_input: bool,

    /// Command prefix to remember if the human approves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_prefix: Option<String>,

    /// Human-readable explanation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl ToolResult {
    pub fn ok(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }

    pub fn needs_approval(reason: impl Into<String>, suggested_prefix: Option<String>) -> Self {
        Self {
            requires_user_input: true,
            suggested_prefix,
            reason: reason.into(),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Text placed in the tool-role message.
    pub fn output_text(&self) -> String {
        if self.is_error() {
            return format!("Error: {}", self.error);
        }
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        Self::err(err.to_string())
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "shell", "read").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with already-validated parameters.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        parameters: serde_json::Value,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// The gated operation this call would perform, if any.
    fn requires_authorization(&self, _parameters: &serde_json::Value) -> Option<AuthRequest> {
        None
    }

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Decode a parameter map into a typed struct.
pub fn decode_params<T: DeserializeOwned>(
    tool_name: &str,
    parameters: serde_json::Value,
) -> std::result::Result<T, ToolError> {
    serde_json::from_value(parameters)
        .map_err(|e| ToolError::InvalidArguments(format!("{tool_name}: {e}")))
}

/// A registry of available tools, ordered by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Get all tool definitions (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Function-calling schemas for every registered tool.
    pub fn to_json_schema(&self) -> Vec<serde_json::Value> {
        self.definitions()
            .iter()
            .map(ToolDefinition::to_function_schema)
            .collect()
    }

    /// A registry holding only the named tools that are registered here.
    pub fn subset(&self, names: &[&str]) -> Self {
        let tools = names
            .iter()
            .filter_map(|name| self.tools.get(*name).map(|t| (name.to_string(), t.clone())))
            .collect();
        Self { tools }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

//! Small tools shared by the crate's unit tests.

use std::time::Duration;

use async_trait::async_trait;
use rustedloop_core::tool::decode_params;
use rustedloop_core::{AuthRequest, Tool, ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub struct EchoTool;

#[derive(Deserialize)]
struct EchoParams {
    text: String,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes back the input"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(&self, _cancel: &CancellationToken, parameters: Value) -> Result<ToolResult, ToolError> {
        let params: EchoParams = decode_params(self.name(), parameters)?;
        Ok(ToolResult::ok(params.text))
    }
}

pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    async fn execute(&self, _cancel: &CancellationToken, _parameters: Value) -> Result<ToolResult, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "fail".into(),
            reason: "intentional failure".into(),
        })
    }
}

/// Pretends to run a command; gated on the command line.
pub struct ShellLikeTool;

#[async_trait]
impl Tool for ShellLikeTool {
    fn name(&self) -> &str {
        "shell"
    }
    fn description(&self) -> &str {
        "Pretends to run a shell command"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "command": { "type": "string" } },
            "required": ["command"]
        })
    }
    fn requires_authorization(&self, parameters: &Value) -> Option<AuthRequest> {
        parameters["command"]
            .as_str()
            .map(|command| AuthRequest::command(self.name(), command))
    }
    async fn execute(&self, _cancel: &CancellationToken, parameters: Value) -> Result<ToolResult, ToolError> {
        let command = parameters["command"].as_str().unwrap_or_default();
        Ok(ToolResult::ok(format!("ran: {command}")))
    }
}

pub struct SlowTool {
    delay: Duration,
}

impl SlowTool {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "Sleeps, then answers"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    async fn execute(&self, cancel: &CancellationToken, _parameters: Value) -> Result<ToolResult, ToolError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled("slow".into())),
            _ = tokio::time::sleep(self.delay) => Ok(ToolResult::ok("slept")),
        }
    }
}

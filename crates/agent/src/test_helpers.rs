//! Shared test helpers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rustedloop_core::tool::decode_params;
use rustedloop_core::{
    AuthRequest, LlmClient, LlmRequest, LlmResponse, MessageToolCall, ProviderError, StopReason, Tool,
    ToolError, ToolResult,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// A client that returns a scripted sequence of results.
///
/// Each call pops the next entry. Once the script runs out every further
/// call fails, which shows up in tests as an unexpected extra model call.
pub struct ScriptedClient {
    model: String,
    script: Mutex<VecDeque<Result<LlmResponse, ProviderError>>>,
    requests: Mutex<Vec<LlmRequest>>,
    delay: Option<Duration>,
    response_ids: bool,
    previous_ids: Mutex<Vec<Option<String>>>,
}

impl ScriptedClient {
    pub fn new(model: &str, script: Vec<Result<LlmResponse, ProviderError>>) -> Self {
        Self {
            model: model.to_string(),
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
            response_ids: false,
            previous_ids: Mutex::new(Vec::new()),
        }
    }

    /// Replies with plain text, one per call.
    pub fn texts(model: &str, texts: &[&str]) -> Self {
        Self::new(model, texts.iter().map(|t| Ok(LlmResponse::text(*t))).collect())
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report `resp-N` as the response id after the N-th call.
    pub fn with_response_ids(mut self) -> Self {
        self.response_ids = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Every value passed to `set_previous_response_id`, in order.
    pub fn previous_ids(&self) -> Vec<Option<String>> {
        self.previous_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete_with_request(
        &self,
        cancel: &CancellationToken,
        request: LlmRequest,
    ) -> Result<LlmResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Other("script exhausted".into())))
    }

    fn last_response_id(&self) -> Option<String> {
        self.response_ids.then(|| format!("resp-{}", self.calls()))
    }

    fn set_previous_response_id(&self, id: Option<String>) {
        self.previous_ids.lock().unwrap().push(id);
    }
}

/// A response asking for one tool call.
pub fn tool_call_response(id: &str, name: &str, arguments: serde_json::Value) -> LlmResponse {
    LlmResponse {
        tool_calls: vec![MessageToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }],
        stop_reason: StopReason::ToolUse,
        ..LlmResponse::default()
    }
}

/// A response cut off by the output limit.
pub fn truncated(text: &str) -> LlmResponse {
    LlmResponse {
        content: text.to_string(),
        stop_reason: StopReason::MaxTokens,
        ..LlmResponse::default()
    }
}

#[derive(Deserialize)]
struct TextParams {
    text: String,
}

pub struct EchoTool;

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
        let params: TextParams = decode_params(self.name(), parameters)?;
        Ok(ToolResult::ok(params.text))
    }
}

#[derive(Deserialize)]
struct CommandParams {
    command: String,
}

/// Pretends to run a command; every command is gated.
#[derive(Default)]
pub struct ShellLikeTool {
    runs: Mutex<Vec<String>>,
}

impl ShellLikeTool {
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

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
        let params: CommandParams = decode_params(self.name(), parameters)?;
        self.runs.lock().unwrap().push(params.command.clone());
        Ok(ToolResult::ok(format!("ran: {}", params.command)))
    }
}

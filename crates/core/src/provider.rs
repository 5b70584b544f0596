//! LLM client and provider-manager traits — the abstraction over model backends.
//!
//! An [`LlmClient`] knows how to send a conversation to one model and get a
//! response back, either complete or as a stream of chunks. A
//! [`ProviderManager`] resolves which models are active, how large their
//! context windows are, and builds clients for them.
//!
//! Wire protocols (OpenAI, Anthropic, local servers) live outside the engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall, NativeFormat};

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Render in the OpenAI function-calling shape.
    pub fn to_function_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Prompt-cache hints forwarded to providers that support them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Mark the system prompt as cacheable.
    #[serde(default)]
    pub cache_system_prompt: bool,

    /// Mark the tool list as cacheable.
    #[serde(default)]
    pub cache_tools: bool,
}

/// A request to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    /// The conversation messages
    pub messages: Vec<Message>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub cache: CacheOptions,
}

impl LlmRequest {
    /// A single-turn request holding one user prompt.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(prompt)],
            ..Self::default()
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    /// Output was cut by the max-token limit.
    MaxTokens,
    StopSequence,
    Other(String),
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A complete response from the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    #[serde(default)]
    pub stop_reason: StopReason,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Opaque provider blob to carry on the assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<NativeFormat>,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Whether the output was cut short by a length limit.
    pub fn is_truncated(&self) -> bool {
        self.stop_reason == StopReason::MaxTokens
    }

    /// Convert into the assistant message appended to the session.
    pub fn into_message(self) -> Message {
        let mut msg = Message::assistant(self.content)
            .with_tool_calls(self.tool_calls)
            .with_native(self.native);
        msg.reasoning = self.reasoning;
        msg
    }
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum StreamChunk {
    Content(String),
    Reasoning(String),
}

/// The core LLM client trait.
///
/// The loop calls `complete_with_request()` or `stream()` without knowing
/// which backend is in use. Every call takes the caller's cancellation token.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// The model this client talks to.
    fn model_name(&self) -> &str;

    /// Single prompt in, text out.
    async fn complete(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> std::result::Result<String, ProviderError> {
        let response = self
            .complete_with_request(cancel, LlmRequest::from_prompt(prompt))
            .await?;
        Ok(response.content)
    }

    /// Send a full request and get a complete response.
    async fn complete_with_request(
        &self,
        cancel: &CancellationToken,
        request: LlmRequest,
    ) -> std::result::Result<LlmResponse, ProviderError>;

    /// Send a request and receive chunks as they are produced.
    ///
    /// Default implementation calls `complete_with_request()` and emits the
    /// reasoning and content as one chunk each.
    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: LlmRequest,
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> std::result::Result<LlmResponse, ProviderError> {
        let response = self.complete_with_request(cancel, request).await?;
        if let Some(reasoning) = response.reasoning.as_ref().filter(|r| !r.is_empty()) {
            on_chunk(StreamChunk::Reasoning(reasoning.clone()));
        }
        if !response.content.is_empty() {
            on_chunk(StreamChunk::Content(response.content.clone()));
        }
        Ok(response)
    }

    /// Provider-side conversation continuation token from the last response.
    fn last_response_id(&self) -> Option<String> {
        None
    }

    /// Continue from a previous provider-side response.
    fn set_previous_response_id(&self, _id: Option<String>) {}
}

/// Resolves active models and builds clients for them.
pub trait ProviderManager: Send + Sync {
    fn orchestration_model(&self) -> String;

    fn summarization_model(&self) -> String;

    /// Context window in tokens; `0` means unknown.
    fn context_window(&self, model: &str) -> usize;

    fn max_output_tokens(&self, model: &str) -> u32;

    /// A client for `model`, if one is configured.
    fn client(&self, model: &str) -> Option<Arc<dyn LlmClient>>;
}

/// A [`ProviderManager`] over a fixed set of pre-built clients.
#[derive(Clone, Default)]
pub struct StaticProviderManager {
    orchestration_model: String,
    summarization_model: String,
    default_context_window: usize,
    default_max_output_tokens: u32,
    context_windows: HashMap<String, usize>,
    clients: HashMap<String, Arc<dyn LlmClient>>,
}

impl StaticProviderManager {
    pub fn new(orchestration_model: impl Into<String>) -> Self {
        let model = orchestration_model.into();
        Self {
            summarization_model: model.clone(),
            orchestration_model: model,
            default_max_output_tokens: 4096,
            ..Self::default()
        }
    }

    pub fn with_summarization_model(mut self, model: impl Into<String>) -> Self {
        self.summarization_model = model.into();
        self
    }

    pub fn with_default_context_window(mut self, window: usize) -> Self {
        self.default_context_window = window;
        self
    }

    pub fn with_context_window(mut self, model: impl Into<String>, window: usize) -> Self {
        self.context_windows.insert(model.into(), window);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.default_max_output_tokens = tokens;
        self
    }

    /// Register a client under its own model name.
    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.clients.insert(client.model_name().to_string(), client);
        self
    }
}

impl std::fmt::Debug for StaticProviderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticProviderManager")
            .field("orchestration_model", &self.orchestration_model)
            .field("summarization_model", &self.summarization_model)
            .field("default_context_window", &self.default_context_window)
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderManager for StaticProviderManager {
    fn orchestration_model(&self) -> String {
        self.orchestration_model.clone()
    }

    fn summarization_model(&self) -> String {
        self.summarization_model.clone()
    }

    fn context_window(&self, model: &str) -> usize {
        self.context_windows
            .get(model)
            .copied()
            .unwrap_or(self.default_context_window)
    }

    fn max_output_tokens(&self, _model: &str) -> u32 {
        self.default_max_output_tokens
    }

    fn client(&self, model: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.get(model).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedClient;

    #[async_trait]
    impl LlmClient for FixedClient {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn complete_with_request(
            &self,
            _cancel: &CancellationToken,
            request: LlmRequest,
        ) -> std::result::Result<LlmResponse, ProviderError> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(LlmResponse {
                content: format!("echo: {last}"),
                reasoning: Some("thinking".into()),
                ..LlmResponse::default()
            })
        }
    }

    #[test]
    fn tool_definition_renders_function_shape() {
        let def = ToolDefinition {
            name: "search".into(),
            description: "Search the codebase".into(),
            parameters: serde_json::json!({"type": "object"}),
        };
        let schema = def.to_function_schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "search");
    }

    #[tokio::test]
    async fn complete_wraps_complete_with_request() {
        let client = FixedClient;
        let text = client.complete(&CancellationToken::new(), "hi").await.unwrap();
        assert_eq!(text, "echo: hi");
    }

    #[tokio::test]
    async fn default_stream_emits_reasoning_then_content() {
        let client = FixedClient;
        let seen = Mutex::new(Vec::new());
        let response = client
            .stream(&CancellationToken::new(), LlmRequest::from_prompt("x"), &|chunk| {
                seen.lock().unwrap().push(chunk);
            })
            .await
            .unwrap();

        assert_eq!(response.content, "echo: x");
        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen,
            vec![
                StreamChunk::Reasoning("thinking".into()),
                StreamChunk::Content("echo: x".into())
            ]
        );
    }

    #[test]
    fn truncation_follows_stop_reason() {
        let mut response = LlmResponse::text("partial");
        assert!(!response.is_truncated());
        response.stop_reason = StopReason::MaxTokens;
        assert!(response.is_truncated());
    }

    #[test]
    fn static_manager_resolves_windows_and_clients() {
        let manager = StaticProviderManager::new("fixed")
            .with_summarization_model("small")
            .with_default_context_window(8192)
            .with_context_window("big", 200_000)
            .with_client(Arc::new(FixedClient));

        assert_eq!(manager.orchestration_model(), "fixed");
        assert_eq!(manager.summarization_model(), "small");
        assert_eq!(manager.context_window("fixed"), 8192);
        assert_eq!(manager.context_window("big"), 200_000);
        assert!(manager.client("fixed").is_some());
        assert!(manager.client("small").is_none());
    }
}

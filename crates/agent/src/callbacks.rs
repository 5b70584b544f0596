//! Per-invocation observer hooks.
//!
//! Callbacks are handed to each loop run explicitly. Every hook is optional;
//! an unset hook is a no-op, except authorization, which denies.

use std::sync::Arc;

use async_trait::async_trait;
use rustedloop_core::{Result, ToolCall, ToolResult};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub type StatusFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type ChunkFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type UsageFn = Arc<dyn Fn(f64, usize) + Send + Sync>;
pub type ToolCallFn = Arc<dyn Fn(&ToolCall) + Send + Sync>;
pub type ToolResultFn = Arc<dyn Fn(&ToolCall, &ToolResult) + Send + Sync>;

/// Asks a human whether a gated tool call may run.
#[async_trait]
pub trait AuthorizationCallback: Send + Sync {
    /// `Ok(true)` approves the call. An `Err` counts as a denial.
    async fn authorize(
        &self,
        cancel: &CancellationToken,
        tool_name: &str,
        parameters: &Value,
        reason: &str,
    ) -> Result<bool>;
}

#[async_trait]
impl<F> AuthorizationCallback for F
where
    F: Fn(&str, &Value, &str) -> Result<bool> + Send + Sync,
{
    async fn authorize(
        &self,
        _cancel: &CancellationToken,
        tool_name: &str,
        parameters: &Value,
        reason: &str,
    ) -> Result<bool> {
        self(tool_name, parameters, reason)
    }
}

#[derive(Clone, Default)]
pub struct LoopCallbacks {
    status: Option<StatusFn>,
    content: Option<ChunkFn>,
    reasoning: Option<ChunkFn>,
    context_usage: Option<UsageFn>,
    tool_call: Option<ToolCallFn>,
    tool_result: Option<ToolResultFn>,
    authorization: Option<Arc<dyn AuthorizationCallback>>,
}

impl LoopCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.status = Some(Arc::new(f));
        self
    }

    pub fn with_content(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.content = Some(Arc::new(f));
        self
    }

    pub fn with_reasoning(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.reasoning = Some(Arc::new(f));
        self
    }

    /// Receives `(free_percent, window)`.
    pub fn with_context_usage(mut self, f: impl Fn(f64, usize) + Send + Sync + 'static) -> Self {
        self.context_usage = Some(Arc::new(f));
        self
    }

    pub fn with_tool_call(mut self, f: impl Fn(&ToolCall) + Send + Sync + 'static) -> Self {
        self.tool_call = Some(Arc::new(f));
        self
    }

    pub fn with_tool_result(mut self, f: impl Fn(&ToolCall, &ToolResult) + Send + Sync + 'static) -> Self {
        self.tool_result = Some(Arc::new(f));
        self
    }

    pub fn with_authorization(mut self, callback: impl AuthorizationCallback + 'static) -> Self {
        self.authorization = Some(Arc::new(callback));
        self
    }

    /// The status hook, for work that outlives this borrow.
    pub fn status_fn(&self) -> Option<StatusFn> {
        self.status.clone()
    }

    /// Whether anyone listens to streamed chunks.
    pub fn wants_stream(&self) -> bool {
        self.content.is_some() || self.reasoning.is_some()
    }

    pub fn status(&self, text: &str) {
        if let Some(f) = &self.status {
            f(text);
        }
    }

    pub fn content(&self, chunk: &str) {
        if let Some(f) = &self.content {
            f(chunk);
        }
    }

    pub fn reasoning(&self, chunk: &str) {
        if let Some(f) = &self.reasoning {
            f(chunk);
        }
    }

    pub fn context_usage(&self, free_percent: f64, window: usize) {
        if let Some(f) = &self.context_usage {
            f(free_percent, window);
        }
    }

    pub fn tool_call(&self, call: &ToolCall) {
        if let Some(f) = &self.tool_call {
            f(call);
        }
    }

    pub fn tool_result(&self, call: &ToolCall, result: &ToolResult) {
        if let Some(f) = &self.tool_result {
            f(call, result);
        }
    }

    /// Ask for approval. Without a callback nothing is approved.
    pub async fn authorize(
        &self,
        cancel: &CancellationToken,
        tool_name: &str,
        parameters: &Value,
        reason: &str,
    ) -> Result<bool> {
        match &self.authorization {
            Some(callback) => callback.authorize(cancel, tool_name, parameters, reason).await,
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for LoopCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopCallbacks")
            .field("status", &self.status.is_some())
            .field("stream", &self.wants_stream())
            .field("context_usage", &self.context_usage.is_some())
            .field("tool_hooks", &(self.tool_call.is_some() || self.tool_result.is_some()))
            .field("authorization", &self.authorization.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn missing_authorization_callback_denies() {
        let callbacks = LoopCallbacks::new();
        let approved = callbacks
            .authorize(&CancellationToken::new(), "shell", &Value::Null, "why")
            .await
            .unwrap();
        assert!(!approved);
    }

    #[tokio::test]
    async fn closure_callbacks_receive_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callbacks = LoopCallbacks::new()
            .with_status(move |s| sink.lock().unwrap().push(s.to_string()))
            .with_authorization(|tool: &str, _params: &Value, reason: &str| {
                Ok(tool == "shell" && reason.contains("git"))
            });

        callbacks.status("working");
        assert_eq!(seen.lock().unwrap().as_slice(), ["working".to_string()]);

        let approved = callbacks
            .authorize(&CancellationToken::new(), "shell", &Value::Null, "run git status")
            .await
            .unwrap();
        assert!(approved);
    }
}

//! Loop observations as a stream of serializable events.
//!
//! [`channel_callbacks`] builds a [`LoopCallbacks`] whose hooks forward
//! everything they see into an unbounded channel, for consumers that would
//! rather poll a stream (a TUI, a websocket bridge) than install closures.
//! Authorization is not part of the stream; attach it to the returned
//! callbacks with [`LoopCallbacks::with_authorization`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::callbacks::LoopCallbacks;
use crate::orchestrator::LoopOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// Human-readable progress line.
    Status { text: String },

    /// Partial text from the model.
    Chunk { content: String },

    /// Partial reasoning from the model.
    Reasoning { content: String },

    ContextUsage { free_percent: f64, window: usize },

    /// The loop is calling a tool.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Tool execution completed.
    ToolResult {
        id: String,
        name: String,
        output: String,
        success: bool,
    },

    /// The run ended.
    Done {
        terminal: String,
        iterations: usize,
        compactions: usize,
    },

    Error { message: String },
}

impl AgentStreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Chunk { .. } => "chunk",
            Self::Reasoning { .. } => "reasoning",
            Self::ContextUsage { .. } => "context_usage",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn done(outcome: &LoopOutcome) -> Self {
        Self::Done {
            terminal: outcome.terminal.as_str().to_string(),
            iterations: outcome.iterations,
            compactions: outcome.compactions,
        }
    }

    pub fn error(err: &impl std::fmt::Display) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

/// Callbacks that forward every observation into a channel.
///
/// Events sent after the receiver is dropped are discarded.
pub fn channel_callbacks() -> (LoopCallbacks, mpsc::UnboundedReceiver<AgentStreamEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let status = tx.clone();
    let chunk = tx.clone();
    let reasoning = tx.clone();
    let usage = tx.clone();
    let call = tx.clone();
    let result = tx;

    let callbacks = LoopCallbacks::new()
        .with_status(move |text| {
            let _ = status.send(AgentStreamEvent::Status { text: text.to_string() });
        })
        .with_content(move |content| {
            let _ = chunk.send(AgentStreamEvent::Chunk {
                content: content.to_string(),
            });
        })
        .with_reasoning(move |content| {
            let _ = reasoning.send(AgentStreamEvent::Reasoning {
                content: content.to_string(),
            });
        })
        .with_context_usage(move |free_percent, window| {
            let _ = usage.send(AgentStreamEvent::ContextUsage { free_percent, window });
        })
        .with_tool_call(move |tool_call| {
            let _ = call.send(AgentStreamEvent::ToolCall {
                id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                input: tool_call.parameters.clone(),
            });
        })
        .with_tool_result(move |tool_call, tool_result| {
            let _ = result.send(AgentStreamEvent::ToolResult {
                id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                output: tool_result.output_text(),
                success: !tool_result.is_error(),
            });
        });

    (callbacks, rx)
}

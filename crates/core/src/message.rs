//! Message domain types.
//!
//! These are the value objects that flow through the whole loop:
//! the user asks → the model answers (possibly with tool calls) → tools reply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key marking messages the loop injected itself
/// (auto-continue prompts, corrective messages).
pub const META_SYNTHETIC: &str = "synthetic";

/// Metadata key marking the message that replaced a compacted prefix.
pub const META_COMPACTION: &str = "compaction_summary";

/// Metadata key on a compaction summary listing the user requests it
/// replaced, oldest first.
pub const META_USER_REQUESTS: &str = "user_requests";

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-specific message representation (prompt-cache markers,
/// continuation blobs). Opaque to the engine and passed through unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeFormat {
    pub provider: String,
    pub model_family: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Reasoning trace produced alongside the content (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// If this is a tool result, the name of the tool that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Opaque provider blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<NativeFormat>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn with_role(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            native: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_role(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg
    }

    /// Create a user message injected by the loop rather than typed by a person.
    pub fn synthetic_user(content: impl Into<String>) -> Self {
        let mut msg = Self::user(content);
        msg.metadata
            .insert(META_SYNTHETIC.into(), serde_json::Value::Bool(true));
        msg
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<MessageToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_native(mut self, native: Option<NativeFormat>) -> Self {
        self.native = native;
        self
    }

    fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether the loop injected this message itself.
    pub fn is_synthetic(&self) -> bool {
        self.flag(META_SYNTHETIC)
    }

    /// Whether this message is a compaction summary.
    pub fn is_compaction_summary(&self) -> bool {
        self.flag(META_COMPACTION)
    }

    /// A user message a person actually wrote.
    pub fn is_user_authored(&self) -> bool {
        self.role == Role::User && !self.is_synthetic() && !self.is_compaction_summary()
    }

    /// Requests a person made that this message stands for: its own content
    /// when user-authored, the recorded list for a compaction summary.
    pub fn user_requests(&self) -> Vec<String> {
        if self.is_user_authored() {
            return vec![self.content.clone()];
        }
        if !self.is_compaction_summary() {
            return Vec::new();
        }
        self.metadata
            .get(META_USER_REQUESTS)
            .and_then(serde_json::Value::as_array)
            .map(|requests| {
                requests
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as JSON string, exactly as the model produced them
    pub arguments: String,
}

//! Error types for the RustedLoop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! wraps them and adds component attribution for fatal construction errors.

use thiserror::Error;

/// The top-level error type for all RustedLoop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Actor runtime errors ---
    #[error("Actor error: {0}")]
    Actor(#[from] ActorError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A required component failed while the runtime was being assembled.
    #[error("{component} failed to start: {source}")]
    Component {
        component: String,
        #[source]
        source: Box<Error>,
    },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Attribute an error to the component that produced it.
    pub fn component(component: impl Into<String>, source: impl Into<Error>) -> Self {
        Self::Component {
            component: component.into(),
            source: Box::new(source.into()),
        }
    }

    /// Whether this error was caused by cancellation of the caller's context.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Provider(e) => matches!(e, ProviderError::Cancelled),
            Self::Tool(e) => matches!(e, ToolError::Cancelled(_)),
            Self::Actor(e) => matches!(e, ActorError::Cancelled),
            Self::Component { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider (429), retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The request did not fit the model's context window.
    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    /// The model produced a tool call the provider refused to accept.
    #[error("Tool call validation failed for '{tool_name}': {message}")]
    ToolCallValidation { tool_name: String, message: String },

    /// The error judge decided not to retry. Keeps the underlying error.
    #[error("{source} (not retried: {reason})")]
    Halted {
        reason: String,
        #[source]
        source: Box<ProviderError>,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Classify a raw provider error message into a typed variant.
    ///
    /// Client adapters that only get a string back from their SDK use this
    /// so the loop can still tell context pressure and tool validation apart
    /// from transient failures.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("context length")
            || lower.contains("context_length_exceeded")
            || lower.contains("maximum context")
            || lower.contains("prompt is too long")
            || lower.contains("too many tokens")
        {
            return Self::ContextLengthExceeded(message);
        }

        if lower.contains("missing required parameter") || lower.contains("tool_use_failed") {
            return Self::ToolCallValidation {
                tool_name: String::new(),
                message,
            };
        }

        Self::Other(message)
    }

    /// Context-size-exceeded failures are handled by compaction, not retry.
    pub fn is_context_length(&self) -> bool {
        match self {
            Self::ContextLengthExceeded(_) => true,
            Self::Halted { source, .. } => source.is_context_length(),
            _ => false,
        }
    }

    /// Tool-call validation failures are recovered locally by the loop.
    pub fn is_tool_validation(&self) -> bool {
        match self {
            Self::ToolCallValidation { .. } => true,
            Self::Halted { source, .. } => source.is_tool_validation(),
            _ => false,
        }
    }

    /// Errors that must never be judged or retried.
    pub fn bypasses_judge(&self) -> bool {
        matches!(
            self,
            Self::ContextLengthExceeded(_) | Self::ToolCallValidation { .. } | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Missing required parameter '{parameter}' for tool '{tool_name}'")]
    MissingParameter { tool_name: String, parameter: String },

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name} — {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Tool cancelled: {0}")]
    Cancelled(String),
}

#[derive(Debug, Clone, Error)]
pub enum ActorError {
    #[error("Failed to spawn actor '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Mailbox of actor '{0}' is closed")]
    MailboxClosed(String),

    #[error("Actor '{0}' dropped the reply channel")]
    ReplyDropped(String),

    #[error("Actor request cancelled")]
    Cancelled,

    #[error("Actor '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("Shutdown timed out with {pending} actor(s) still draining")]
    ShutdownTimeout { pending: usize },
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Stale revision: expected {expected}, session is at {actual}")]
    StaleRevision { expected: u64, actual: u64 },

    #[error("Invalid compaction prefix: {prefix_len} of {available} messages")]
    InvalidPrefix { prefix_len: usize, available: usize },
}

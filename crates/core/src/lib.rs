//! # RustedLoop Core
//!
//! Domain types, collaborator traits, and error definitions for the RustedLoop
//! agent-loop engine. This crate has **no runtime policy** in it. It defines
//! the model that the actor runtime, the tool dispatcher and the orchestration
//! loop are written against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (LLM client, provider manager, tool, prefix
//! store) is a trait here. Implementations live in their respective crates or
//! in the embedding application. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod auth;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use auth::{AuthDecision, AuthKind, AuthRequest, PrefixStore};
pub use error::{ActorError, Error, ProviderError, Result, SessionError, ToolError};
pub use event::{EventBus, LoopEvent};
pub use message::{Message, MessageToolCall, NativeFormat, Role};
pub use provider::{
    LlmClient, LlmRequest, LlmResponse, ProviderManager, StaticProviderManager, StopReason,
    StreamChunk, ToolDefinition, Usage,
};
pub use session::{CompactionSummary, Session, SessionId, SessionSnapshot};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};

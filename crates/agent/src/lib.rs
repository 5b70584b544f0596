//! The RustedLoop agent loop.
//!
//! One [`Orchestrator`] drives one session through a **Request → Act →
//! Observe** cycle:
//!
//! 1. **Report** context usage and start a background compaction near the window
//! 2. **Send** the history to the model, retrying failures the judge deems transient
//! 3. **Guard** against exact-repeat loops and replies that stopped too early
//! 4. **Execute** requested tools in order, asking for approval where a tool needs it
//! 5. **Repeat** until the model answers without tool calls, or a limit is hit
//!
//! [`AgentRuntime`] wires the shared actors (authorization, todo list, job
//! table, error judge) and hands out orchestrators and the narrow agents in
//! [`specialized`].

pub mod auto_continue;
pub mod callbacks;
pub mod context;
pub mod loop_detect;
pub mod orchestrator;
pub mod retry;
pub mod runtime;
pub mod specialized;
pub mod stream_event;

#[cfg(test)]
mod test_helpers;

pub use auto_continue::{AutoContinue, CONTINUE_PROMPT, ContinueContext, ContinueStrategy, strategy_from_config};
pub use callbacks::{AuthorizationCallback, LoopCallbacks};
pub use context::{CompactionOutcome, Compactor, ContextManager, ContextUsage, TokenEstimate, estimate_tokens};
pub use loop_detect::{LoopDetection, LoopDetector};
pub use orchestrator::{
    DENIED_BY_USER, Dependencies, LoopConfig, LoopOutcome, Orchestrator, StaticPrompt,
    SystemPromptProvider, Terminal, Transition,
};
pub use retry::{
    ErrorDecision, ErrorJudge, ErrorJudgeActor, HeuristicJudge, LlmJudge, complete_with_retry,
    retry_with_judge,
};
pub use runtime::AgentRuntime;
pub use specialized::{InvestigationAgent, InvestigationReport, VerificationAgent, VerificationResult};
pub use stream_event::{AgentStreamEvent, channel_callbacks};

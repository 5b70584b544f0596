//! Auto-continue policies.
//!
//! When the model stops without calling a tool, or its output was cut off,
//! a [`ContinueStrategy`] decides whether the loop should nudge it with a
//! synthetic "continue" turn instead of treating the text as the final
//! answer.

use std::sync::Arc;

use async_trait::async_trait;
use rustedloop_config::ContinueStrategyKind;
use rustedloop_core::{LlmClient, Session};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Synthetic user turn sent when the loop decides to continue.
pub const CONTINUE_PROMPT: &str =
    "Continue from where you stopped. Do not repeat what you already wrote.";

/// Leading phrases of a last line that announces work not yet done.
const ANNOUNCEMENTS: &[&str] = &["i will", "i'll", "let me", "next, i", "now i"];

/// What the strategy gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct ContinueContext<'a> {
    pub content: &'a str,
    pub truncated: bool,
    pub has_tool_calls: bool,
}

#[async_trait]
pub trait ContinueStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn should_continue(&self, cancel: &CancellationToken, ctx: &ContinueContext<'_>) -> bool;
}

/// The built-in policies.
#[derive(Clone)]
pub enum AutoContinue {
    /// Truncation, or text that ends mid-thought.
    Default,
    /// Truncation only.
    Conservative,
    /// Always, while attempts remain.
    Aggressive,
    /// Ask a model; [`AutoContinue::Default`] rules when it cannot answer.
    LlmJudge {
        client: Arc<dyn LlmClient>,
        session: Arc<Session>,
    },
    Disabled,
}

impl AutoContinue {
    fn default_rule(ctx: &ContinueContext<'_>) -> bool {
        ctx.truncated || looks_unfinished(ctx.content)
    }

    async fn ask_judge(
        client: &Arc<dyn LlmClient>,
        session: &Session,
        cancel: &CancellationToken,
        ctx: &ContinueContext<'_>,
    ) -> Option<bool> {
        let request = session
            .messages()
            .iter()
            .rev()
            .find(|m| m.is_user_authored())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let prompt = format!(
            "An assistant is working on this request:\n{request}\n\n\
             Its latest reply was:\n{content}\n\n\
             Did the assistant stop before finishing the request? Answer YES or NO only.",
            content = ctx.content,
        );

        match client.complete(cancel, &prompt).await {
            Ok(answer) => parse_yes_no(&answer),
            Err(e) => {
                warn!(error = %e, "Continue judge failed, using default rule");
                None
            }
        }
    }
}

impl std::fmt::Debug for AutoContinue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[async_trait]
impl ContinueStrategy for AutoContinue {
    fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Conservative => "conservative",
            Self::Aggressive => "aggressive",
            Self::LlmJudge { .. } => "llm_judge",
            Self::Disabled => "disabled",
        }
    }

    async fn should_continue(&self, cancel: &CancellationToken, ctx: &ContinueContext<'_>) -> bool {
        match self {
            Self::Default => Self::default_rule(ctx),
            Self::Conservative => ctx.truncated,
            Self::Aggressive => true,
            Self::Disabled => false,
            Self::LlmJudge { client, session } => {
                if ctx.truncated {
                    return true;
                }
                match Self::ask_judge(client, session, cancel, ctx).await {
                    Some(answer) => {
                        debug!(answer, "Continue judge answered");
                        answer
                    }
                    None => Self::default_rule(ctx),
                }
            }
        }
    }
}

/// Build the configured policy. `LlmJudge` without a client degrades to
/// `Default`.
pub fn strategy_from_config(
    kind: ContinueStrategyKind,
    client: Option<Arc<dyn LlmClient>>,
    session: Arc<Session>,
) -> AutoContinue {
    match kind {
        ContinueStrategyKind::Default => AutoContinue::Default,
        ContinueStrategyKind::Conservative => AutoContinue::Conservative,
        ContinueStrategyKind::Aggressive => AutoContinue::Aggressive,
        ContinueStrategyKind::Disabled => AutoContinue::Disabled,
        ContinueStrategyKind::LlmJudge => match client {
            Some(client) => AutoContinue::LlmJudge { client, session },
            None => {
                warn!("llm_judge auto-continue needs a client, using default");
                AutoContinue::Default
            }
        },
    }
}

/// Whether `text` ends in a way that promises more.
pub fn looks_unfinished(text: &str) -> bool {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.ends_with(':') || trimmed.ends_with("...") || trimmed.ends_with('…') {
        return true;
    }
    let last_line = trimmed.lines().last().unwrap_or_default().trim().to_lowercase();
    ANNOUNCEMENTS.iter().any(|p| last_line.starts_with(p))
}

fn parse_yes_no(answer: &str) -> Option<bool> {
    let word = answer
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if word.starts_with("yes") {
        Some(true)
    } else if word.starts_with("no") {
        Some(false)
    } else {
        None
    }
}

//! Summary text for a compacted prefix.
//!
//! The body is model prose when the summarization client answers in time,
//! otherwise a deterministic bullet list. Either way a user-prompt section is
//! appended so the person's requests survive compaction.

use std::sync::Arc;
use std::time::Duration;

use rustedloop_core::{LlmClient, Message, ProviderError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::token::TokenCounter;

pub const SUMMARY_HEADER: &str = "[Summary of earlier conversation]";

const USER_PROMPT_DIVIDER: &str = "\n---\n";

/// Collapse whitespace and cut to at most `max_chars` characters, ending in
/// `...` when something was dropped.
pub fn condense(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = collapsed.chars().take(keep).collect();
    out.push_str("...");
    out
}

fn message_text(message: &Message) -> String {
    if !message.content.trim().is_empty() || message.tool_calls.is_empty() {
        return message.content.clone();
    }
    let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
    format!("called {}", names.join(", "))
}

/// One `- [role] text` line per message.
pub fn fallback_summary(messages: &[Message], max_chars: usize) -> String {
    messages
        .iter()
        .map(|m| format!("- [{}] {}", m.role, condense(&message_text(m), max_chars)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn summarization_prompt(messages: &[Message]) -> String {
    let mut prompt = String::from(
        "Summarize the conversation below so it can replace the original messages. \
         Keep decisions, facts learned, files and commands involved, open problems \
         and what was about to happen next. Write plain prose, no preamble.\n\n",
    );
    for message in messages {
        prompt.push_str(&format!("[{}]: {}\n", message.role, message_text(message)));
        if let Some(name) = &message.tool_name {
            prompt.push_str(&format!("(result of {name})\n"));
        }
    }
    prompt
}

/// Ask `client` for a prose summary, bounded by `timeout`.
pub async fn summarize_with_client(
    cancel: &CancellationToken,
    client: &Arc<dyn LlmClient>,
    messages: &[Message],
    timeout: Duration,
) -> Result<String, ProviderError> {
    let prompt = summarization_prompt(messages);
    let call = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = client.complete(cancel, &prompt) => result,
        }
    };
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Ok(Ok(_)) => Err(ProviderError::Other("empty summary".into())),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProviderError::Timeout(format!(
            "summary took longer than {}s",
            timeout.as_secs()
        ))),
    }
}

/// The summary body: model prose, or the bullet list when there is no
/// client or it fails.
pub async fn summary_body(
    cancel: &CancellationToken,
    client: Option<&Arc<dyn LlmClient>>,
    messages: &[Message],
    timeout: Duration,
    max_chars: usize,
) -> String {
    let Some(client) = client else {
        debug!("No summarization client, using fallback summary");
        return fallback_summary(messages, max_chars);
    };
    match summarize_with_client(cancel, client, messages, timeout).await {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Summarization failed, using fallback summary");
            fallback_summary(messages, max_chars)
        }
    }
}

/// Limits for [`user_prompt_section`].
#[derive(Debug, Clone, Copy)]
pub struct UserPromptLimits {
    pub effective_window: usize,
    /// Below this share of the window prompts are kept verbatim
    pub verbatim_share: f64,
    pub max_chars: usize,
}

/// Every request the person made in `messages`, oldest first. Requests an
/// earlier compaction replaced are read back from its summary.
pub fn user_requests(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .flat_map(Message::user_requests)
        .filter(|r| !r.trim().is_empty())
        .collect()
}

/// Requests the person made inside `prefix`, plus the most recent one from
/// the whole `history` with an instruction to keep working on it.
pub fn user_prompt_section(
    prefix: &[Message],
    history: &[Message],
    counter: &TokenCounter,
    limits: UserPromptLimits,
) -> String {
    let mut section = String::new();

    let prompts = user_requests(prefix);

    if !prompts.is_empty() {
        let tokens: usize = prompts.iter().map(|p| counter.text(p)).sum();
        let verbatim = limits.effective_window > 0
            && (tokens as f64 / limits.effective_window as f64) < limits.verbatim_share;

        section.push_str("User requests so far:\n");
        if verbatim {
            section.push_str(&prompts.join(USER_PROMPT_DIVIDER));
        } else {
            let numbered: Vec<String> = prompts
                .iter()
                .enumerate()
                .map(|(i, p)| format!("{}. {}", i + 1, condense(p, limits.max_chars)))
                .collect();
            section.push_str(&numbered.join("\n"));
        }
        section.push_str("\n\n");
    }

    if let Some(latest) = user_requests(history).last() {
        section.push_str("Most recent user request (verbatim):\n");
        section.push_str(latest);
        section.push_str("\n\nContinue working on this request from where the conversation left off.");
    }

    section.trim_end().to_string()
}

/// Assemble the final summary message text.
pub fn compose(body: &str, user_section: &str) -> String {
    if user_section.is_empty() {
        format!("{SUMMARY_HEADER}\n\n{body}")
    } else {
        format!("{SUMMARY_HEADER}\n\n{body}\n\n{user_section}")
    }
}

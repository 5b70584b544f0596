//! `rustedloop estimate` — Token usage of a saved transcript.

use std::path::Path;

use anyhow::{Context, bail};
use rustedloop_agent::context::should_compact;
use rustedloop_agent::estimate_tokens;
use rustedloop_core::{Message, MessageToolCall, Role};
use serde::Deserialize;

use super::load_config;

/// One transcript line. Only the fields that count toward the context.
#[derive(Debug, Deserialize)]
struct TranscriptEntry {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<MessageToolCall>,
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
}

impl From<TranscriptEntry> for Message {
    fn from(entry: TranscriptEntry) -> Self {
        let mut message = match entry.role {
            Role::User => Message::user(entry.content),
            Role::Assistant => Message::assistant(entry.content).with_tool_calls(entry.tool_calls),
            Role::System => Message::system(entry.content),
            Role::Tool => Message::tool_result(
                entry.tool_call_id.unwrap_or_default(),
                entry.tool_name.unwrap_or_default(),
                entry.content,
            ),
        };
        message.reasoning = entry.reasoning;
        message
    }
}

/// Parse a JSON array of messages, or one JSON message per line.
fn parse_transcript(text: &str) -> anyhow::Result<Vec<Message>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        let entries: Vec<TranscriptEntry> =
            serde_json::from_str(trimmed).context("Transcript is not a JSON array of messages")?;
        return Ok(entries.into_iter().map(Message::from).collect());
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<TranscriptEntry>(line)
                .map(Message::from)
                .with_context(|| format!("Invalid message on line {}", i + 1))
        })
        .collect()
}

pub async fn run(
    config_path: &Path,
    transcript: &Path,
    model: Option<&str>,
    system_prompt: &str,
    per_message: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let text = std::fs::read_to_string(transcript)
        .with_context(|| format!("Failed to read {}", transcript.display()))?;
    let messages = parse_transcript(&text)?;
    if messages.is_empty() && system_prompt.is_empty() {
        bail!("{} contains no messages", transcript.display());
    }

    let model = model.unwrap_or(&config.model.orchestration);
    let window = config.model.context_window;
    let estimate = estimate_tokens(model, system_prompt, &messages);
    tracing::debug!(model, messages = messages.len(), approximate = estimate.approximate, "Estimated transcript");

    println!("📏 Context estimate for {model}");
    println!("─────────────────────────────────────");
    println!("  Messages:  {}", messages.len());
    println!(
        "  Tokens:    {}{}",
        estimate.total,
        if estimate.approximate { " (approximate)" } else { "" }
    );
    if window > 0 {
        let used = estimate.total as f64 / window as f64 * 100.0;
        println!("  Window:    {window} ({used:.1}% used)");
        let compact = config.compaction.enabled && should_compact(messages.len(), estimate.total, window);
        println!("  Compacts:  {}", if compact { "yes" } else { "no" });
    } else {
        println!("  Window:    unknown");
    }

    if per_message {
        println!();
        for (message, tokens) in messages.iter().zip(&estimate.per_message) {
            let preview: String = message.content.chars().take(60).collect();
            println!("  {:>7}  {:<9} {}", tokens, message.role, preview.replace('\n', " "));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_and_lines() {
        let array = r#"[
            {"role": "user", "content": "list files"},
            {"role": "assistant", "content": "", "tool_calls": [{"id": "c1", "name": "shell", "arguments": "{\"command\":\"ls\"}"}]},
            {"role": "tool", "content": "a.rs", "tool_call_id": "c1", "tool_name": "shell"}
        ]"#;
        let messages = parse_transcript(array).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].tool_calls[0].name, "shell");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));

        let lines = "{\"role\": \"user\", \"content\": \"hi\"}\n\n{\"role\": \"assistant\", \"content\": \"hello\"}\n";
        let messages = parse_transcript(lines).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[test]
    fn reports_bad_line() {
        let err = parse_transcript("{\"role\": \"user\"}\nnot json\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}

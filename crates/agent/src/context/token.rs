//! Token estimation.
//!
//! Models with a known BPE tokenizer are counted exactly through
//! `tiktoken-rs`. Everything else falls back to a character heuristic
//! (~4 characters per token plus a fixed per-message overhead) and the
//! estimate is flagged as approximate.

use rustedloop_core::Message;
use tiktoken_rs::{CoreBPE, tokenizer};

/// Per-message framing overhead for the exact count (role and delimiters).
const EXACT_MESSAGE_OVERHEAD: usize = 3;

/// Per-message overhead for the heuristic count.
const APPROX_MESSAGE_OVERHEAD: usize = 4;

/// Result of [`estimate_tokens`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenEstimate {
    /// System prompt plus every message
    pub total: usize,
    /// One entry per message, in order
    pub per_message: Vec<usize>,
    /// `true` when the heuristic was used
    pub approximate: bool,
}

fn bpe_for_model(model: &str) -> Option<&'static CoreBPE> {
    let tokenizer = tokenizer::get_tokenizer(model)?;
    Some(match tokenizer {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    })
}

/// Counts text for one model, exactly when the model is recognized.
#[derive(Clone, Copy)]
pub struct TokenCounter {
    bpe: Option<&'static CoreBPE>,
}

impl TokenCounter {
    pub fn for_model(model: &str) -> Self {
        Self {
            bpe: bpe_for_model(model),
        }
    }

    pub fn is_exact(&self) -> bool {
        self.bpe.is_some()
    }

    /// Tokens in a bare string.
    pub fn text(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len().div_ceil(4),
        }
    }

    /// Tokens in a message, including framing overhead.
    pub fn message(&self, message: &Message) -> usize {
        let overhead = if self.is_exact() {
            EXACT_MESSAGE_OVERHEAD
        } else {
            APPROX_MESSAGE_OVERHEAD
        };

        let mut tokens = overhead + self.text(&message.content);
        if let Some(reasoning) = &message.reasoning {
            tokens += self.text(reasoning);
        }
        for call in &message.tool_calls {
            tokens += self.text(&call.name) + self.text(&call.arguments);
        }
        tokens
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("exact", &self.is_exact())
            .finish()
    }
}

/// Estimate the tokens a request for `model_id` will consume.
pub fn estimate_tokens(model_id: &str, system_prompt: &str, messages: &[Message]) -> TokenEstimate {
    let counter = TokenCounter::for_model(model_id);
    let per_message: Vec<usize> = messages.iter().map(|m| counter.message(m)).collect();
    let total = counter.text(system_prompt) + per_message.iter().sum::<usize>();

    TokenEstimate {
        total,
        per_message,
        approximate: !counter.is_exact(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_is_approximate_and_positive() {
        let estimate = estimate_tokens("my-local-model", "", &[Message::user("hi")]);
        assert!(estimate.approximate);
        assert!(estimate.total > 0);
    }

    #[test]
    fn recognized_model_is_exact() {
        let estimate = estimate_tokens("gpt-4o", "You are helpful.", &[Message::user("hello world")]);
        assert!(!estimate.approximate);
        assert!(estimate.total > 0);
    }

    #[test]
    fn heuristic_counts_four_chars_per_token_plus_overhead() {
        let counter = TokenCounter::for_model("my-local-model");
        assert_eq!(counter.text(""), 0);
        assert_eq!(counter.text("test"), 1);
        assert_eq!(counter.text("hello"), 2);
        // 4 chars -> 1 token + 4 overhead
        assert_eq!(counter.message(&Message::user("test")), 5);
    }

    #[test]
    fn total_includes_system_prompt() {
        let messages = vec![Message::user("hello"), Message::assistant("world")];
        let without = estimate_tokens("my-local-model", "", &messages);
        let with = estimate_tokens("my-local-model", "a".repeat(40).as_str(), &messages);
        assert_eq!(without.per_message, vec![6, 6]);
        assert_eq!(without.total, 12);
        assert_eq!(with.total, 22);
    }

    #[test]
    fn tool_calls_are_counted() {
        let plain = Message::assistant("");
        let with_call = Message::assistant("").with_tool_calls(vec![
            rustedloop_core::MessageToolCall {
                id: "c1".into(),
                name: "search".into(),
                arguments: r#"{"query":"rust actors"}"#.into(),
            },
        ]);
        let counter = TokenCounter::for_model("my-local-model");
        assert!(counter.message(&with_call) > counter.message(&plain));
    }

    #[test]
    fn empty_input_is_zero() {
        let estimate = estimate_tokens("my-local-model", "", &[]);
        assert_eq!(estimate.total, 0);
        assert!(estimate.per_message.is_empty());
    }
}

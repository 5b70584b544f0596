//! Context-window management.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`token`] | Exact or approximate token counts per message |
//! | [`ContextManager`] | Window lookup, usage reporting, the compaction trigger |
//! | [`summary`] | Summary text: model prose or a deterministic fallback, plus the user-prompt section |
//! | [`compactor`] | One-at-a-time prefix compaction applied with a revision check |

pub mod compactor;
pub mod summary;
pub mod token;

use std::sync::Arc;

use rustedloop_config::CompactionConfig;
use rustedloop_core::{Message, ProviderManager};

pub use compactor::{CompactionOutcome, Compactor};
pub use token::{TokenCounter, TokenEstimate, estimate_tokens};

/// Usage ratio of the window that triggers compaction.
pub const COMPACTION_TRIGGER_RATIO: f64 = 0.90;

/// Share of total tokens folded into the summary.
pub const COMPACTION_PREFIX_RATIO: f64 = 0.40;

/// Histories shorter than this are never compacted.
pub const MIN_COMPACTION_MESSAGES: usize = 4;

/// Messages always left after the compacted prefix.
pub const KEEP_TRAILING_MESSAGES: usize = 2;

/// Whether a history of `messages_len` messages and `total` tokens should be
/// compacted for a model with a `window`-token context. An unknown window
/// (0) never triggers.
pub fn should_compact(messages_len: usize, total: usize, window: usize) -> bool {
    should_compact_at(
        messages_len,
        total,
        window,
        MIN_COMPACTION_MESSAGES,
        COMPACTION_TRIGGER_RATIO,
    )
}

fn should_compact_at(
    messages_len: usize,
    total: usize,
    window: usize,
    min_messages: usize,
    trigger_ratio: f64,
) -> bool {
    if window == 0 || messages_len < min_messages {
        return false;
    }
    total as f64 / window as f64 >= trigger_ratio
}

/// Length of the prefix holding the first 40% of `total` tokens.
pub fn select_compaction_prefix(per_message: &[usize], total: usize) -> usize {
    select_prefix_with_ratio(per_message, total, COMPACTION_PREFIX_RATIO)
}

/// Walk `per_message` until the running sum reaches `ratio` of `total`.
/// Always covers at least the first message of a non-empty history.
pub fn select_prefix_with_ratio(per_message: &[usize], total: usize, ratio: f64) -> usize {
    if per_message.is_empty() {
        return 0;
    }
    let threshold = total as f64 * ratio;
    let mut sum = 0usize;
    for (index, tokens) in per_message.iter().enumerate() {
        sum += tokens;
        if sum as f64 >= threshold {
            return index + 1;
        }
    }
    per_message.len()
}

/// Shrink `prefix` so that at least `keep_trailing` of `len` messages stay.
/// Zero means there is nothing to compact.
pub fn clamp_prefix(prefix: usize, len: usize, keep_trailing: usize) -> usize {
    prefix.min(len.saturating_sub(keep_trailing))
}

/// Context usage at one point in the loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub total: usize,
    pub window: usize,
    /// Percentage of the window still free; 100 when the window is unknown
    pub free_percent: f64,
    pub approximate: bool,
}

/// Resolves model limits and applies the compaction policy.
pub struct ContextManager {
    config: CompactionConfig,
    providers: Arc<dyn ProviderManager>,
}

impl ContextManager {
    pub fn new(config: CompactionConfig, providers: Arc<dyn ProviderManager>) -> Self {
        Self { config, providers }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn providers(&self) -> &Arc<dyn ProviderManager> {
        &self.providers
    }

    pub fn model(&self) -> String {
        self.providers.orchestration_model()
    }

    /// Context window of the orchestration model; 0 when unknown.
    pub fn window(&self) -> usize {
        self.providers.context_window(&self.model())
    }

    /// Window left for input once the output budget is reserved.
    pub fn effective_window(&self) -> usize {
        let window = self.window();
        let model = self.model();
        let reserved = self.providers.max_output_tokens(&model) as usize;
        match window.checked_sub(reserved) {
            Some(effective) if effective > 0 => effective,
            _ => window,
        }
    }

    pub fn counter(&self) -> TokenCounter {
        TokenCounter::for_model(&self.model())
    }

    pub fn estimate(&self, system_prompt: &str, messages: &[Message]) -> TokenEstimate {
        estimate_tokens(&self.model(), system_prompt, messages)
    }

    pub fn usage(&self, estimate: &TokenEstimate) -> ContextUsage {
        let window = self.window();
        let free_percent = if window == 0 {
            100.0
        } else {
            (100.0 * (1.0 - estimate.total as f64 / window as f64)).clamp(0.0, 100.0)
        };
        ContextUsage {
            total: estimate.total,
            window,
            free_percent,
            approximate: estimate.approximate,
        }
    }

    /// The configured trigger, on top of [`should_compact`]'s rules.
    pub fn should_compact(&self, messages_len: usize, total: usize) -> bool {
        self.config.enabled
            && should_compact_at(
                messages_len,
                total,
                self.window(),
                self.config.min_messages,
                self.config.trigger_ratio,
            )
    }
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("config", &self.config)
            .field("model", &self.model())
            .field("window", &self.window())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustedloop_core::StaticProviderManager;

    #[test]
    fn empty_history_selects_nothing() {
        assert_eq!(select_compaction_prefix(&[], 100), 0);
    }

    #[test]
    fn prefix_stops_once_forty_percent_is_reached() {
        // threshold 16: 10 after the first message, 20 after the second
        assert_eq!(select_compaction_prefix(&[10, 10, 10, 10], 40), 2);
    }

    #[test]
    fn large_first_message_is_cut_alone() {
        assert_eq!(select_compaction_prefix(&[100, 5, 5, 5], 115), 1);
    }

    #[test]
    fn clamp_keeps_two_trailing_messages() {
        assert_eq!(clamp_prefix(3, 3, 2), 1);
        assert_eq!(clamp_prefix(1, 3, 2), 1);
        assert_eq!(clamp_prefix(2, 2, 2), 0);
        assert_eq!(clamp_prefix(5, 1, 2), 0);
    }

    #[test]
    fn trigger_needs_length_window_and_ratio() {
        assert!(should_compact(4, 900, 1000));
        assert!(!should_compact(3, 990, 1000));
        assert!(!should_compact(10, 899, 1000));
        assert!(!should_compact(10, 5000, 0));
    }

    #[test]
    fn manager_reports_free_percent() {
        let providers = Arc::new(StaticProviderManager::new("my-local-model").with_default_context_window(1000));
        let manager = ContextManager::new(CompactionConfig::default(), providers);
        let usage = manager.usage(&TokenEstimate {
            total: 250,
            per_message: vec![250],
            approximate: true,
        });
        assert_eq!(usage.window, 1000);
        assert!((usage.free_percent - 75.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_compaction_never_triggers() {
        let providers = Arc::new(StaticProviderManager::new("my-local-model").with_default_context_window(1000));
        let config = CompactionConfig {
            enabled: false,
            ..CompactionConfig::default()
        };
        let manager = ContextManager::new(config, providers);
        assert!(!manager.should_compact(10, 999));
    }
}

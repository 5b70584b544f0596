//! Detection of a model repeating itself.
//!
//! Outputs are compared after normalization (trimmed, whitespace collapsed,
//! lowercased). The detector fires when the same normalized output arrives
//! `threshold` times in a row.

/// A detected repetition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDetection {
    /// The repeated output, normalized and shortened for display
    pub pattern: String,
    pub count: usize,
}

const PATTERN_DISPLAY_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct LoopDetector {
    threshold: usize,
    last: Option<String>,
    streak: usize,
}

impl LoopDetector {
    /// `threshold` of 0 disables detection.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            last: None,
            streak: 0,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.streak = 0;
    }

    /// Record one output. Returns a detection once the streak reaches the
    /// threshold.
    pub fn observe(&mut self, text: &str) -> Option<LoopDetection> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            self.reset();
            return None;
        }

        if self.last.as_deref() == Some(normalized.as_str()) {
            self.streak += 1;
        } else {
            self.last = Some(normalized);
            self.streak = 1;
        }

        if self.threshold == 0 || self.streak < self.threshold {
            return None;
        }

        let pattern = self.last.as_deref().unwrap_or_default();
        Some(LoopDetection {
            pattern: shorten(pattern),
            count: self.streak,
        })
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn shorten(pattern: &str) -> String {
    if pattern.chars().count() <= PATTERN_DISPLAY_CHARS {
        return pattern.to_string();
    }
    let mut out: String = pattern.chars().take(PATTERN_DISPLAY_CHARS).collect();
    out.push_str("...");
    out
}

//! Configuration loading, validation, and management for RustedLoop.
//!
//! Loads configuration from `~/.rustedloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.

mod prefix_store;

pub use prefix_store::TomlPrefixStore;

use rustedloop_core::StaticProviderManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.rustedloop/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model selection and limits
    #[serde(default)]
    pub model: ModelConfig,

    /// Orchestration loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Error judge and retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Context compaction settings
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Authorization gate settings
    #[serde(default)]
    pub authorization: AuthorizationConfig,

    /// Actor runtime settings
    #[serde(default)]
    pub actors: ActorsConfig,

    /// Tool dispatch settings
    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_true() -> bool {
    true
}

// ── Model ──

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model driving the orchestration loop
    #[serde(default = "default_model")]
    pub orchestration: String,

    /// Model used for compaction summaries; empty = same as orchestration
    #[serde(default)]
    pub summarization: String,

    /// Context window in tokens; 0 = unknown (compaction disabled)
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_model() -> String {
    "gpt-4o".into()
}
fn default_context_window() -> usize {
    128_000
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.7
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("orchestration", &self.orchestration)
            .field("summarization", &self.summarization)
            .field("context_window", &self.context_window)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("temperature", &self.temperature)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            orchestration: default_model(),
            summarization: String::new(),
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            api_key: None,
        }
    }
}

impl ModelConfig {
    /// The summarization model, falling back to the orchestration model.
    pub fn summarization_model(&self) -> &str {
        if self.summarization.is_empty() {
            &self.orchestration
        } else {
            &self.summarization
        }
    }

    /// A provider manager with these models and limits. Clients are
    /// registered by the embedding application.
    pub fn provider_manager(&self) -> StaticProviderManager {
        StaticProviderManager::new(self.orchestration.clone())
            .with_summarization_model(self.summarization_model())
            .with_default_context_window(self.context_window)
            .with_max_output_tokens(self.max_output_tokens)
    }
}

// ── Agent ──

/// Which auto-continue policy the loop uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinueStrategyKind {
    #[default]
    Default,
    Conservative,
    Aggressive,
    LlmJudge,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on loop iterations per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Consecutive identical outputs that count as a loop
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,

    #[serde(default)]
    pub auto_continue: ContinueStrategyKind,

    #[serde(default = "default_auto_continue_attempts")]
    pub max_auto_continue_attempts: usize,

    /// Per-model overrides of `max_auto_continue_attempts`
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub auto_continue_overrides: HashMap<String, usize>,
}

fn default_max_iterations() -> usize {
    256
}
fn default_loop_threshold() -> usize {
    3
}
fn default_auto_continue_attempts() -> usize {
    3
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            loop_threshold: default_loop_threshold(),
            auto_continue: ContinueStrategyKind::default(),
            max_auto_continue_attempts: default_auto_continue_attempts(),
            auto_continue_overrides: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Auto-continue bound for `model`.
    pub fn max_auto_continue_attempts(&self, model: &str) -> usize {
        self.auto_continue_overrides
            .get(model)
            .copied()
            .unwrap_or(self.max_auto_continue_attempts)
    }
}

// ── Retry ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeMode {
    #[default]
    Heuristic,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub judge: JudgeMode,
}

fn default_retry_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            judge: JudgeMode::default(),
        }
    }
}

// ── Compaction ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Usage ratio of the window that triggers compaction
    #[serde(default = "default_trigger_ratio")]
    pub trigger_ratio: f64,

    /// Share of total tokens folded into the summary
    #[serde(default = "default_prefix_ratio")]
    pub prefix_ratio: f64,

    #[serde(default = "default_min_messages")]
    pub min_messages: usize,

    /// Messages always left uncompacted at the tail
    #[serde(default = "default_keep_trailing")]
    pub keep_trailing: usize,

    #[serde(default = "default_summary_timeout_secs")]
    pub summary_timeout_secs: u64,

    /// User prompts below this share of the window are kept verbatim
    #[serde(default = "default_user_prompt_share")]
    pub user_prompt_share: f64,

    #[serde(default = "default_condense_chars")]
    pub condense_chars: usize,
}

fn default_trigger_ratio() -> f64 {
    0.90
}
fn default_prefix_ratio() -> f64 {
    0.40
}
fn default_min_messages() -> usize {
    4
}
fn default_keep_trailing() -> usize {
    2
}
fn default_summary_timeout_secs() -> u64 {
    60
}
fn default_user_prompt_share() -> f64 {
    0.05
}
fn default_condense_chars() -> usize {
    200
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_ratio: default_trigger_ratio(),
            prefix_ratio: default_prefix_ratio(),
            min_messages: default_min_messages(),
            keep_trailing: default_keep_trailing(),
            summary_timeout_secs: default_summary_timeout_secs(),
            user_prompt_share: default_user_prompt_share(),
            condense_chars: default_condense_chars(),
        }
    }
}

impl CompactionConfig {
    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_secs)
    }
}

// ── Authorization ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationMode {
    /// Unlisted operations are sent to a human
    #[default]
    Interactive,
    /// Unlisted operations are denied
    Allowlist,
    /// Everything is allowed
    AllowAll,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub mode: AuthorizationMode,

    /// Pre-authorized command prefixes (token-boundary match)
    #[serde(default)]
    pub allowed_prefixes: Vec<String>,

    /// Pre-authorized domains (subdomains included)
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

// ── Actors ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorsConfig {
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_mailbox_capacity() -> usize {
    64
}
fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for ActorsConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ActorsConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// ── Tools ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Concurrent sub-calls in the `parallel` tool
    #[serde(default = "default_parallel_workers")]
    pub parallel_max_workers: usize,

    /// Route executions through the executor actor
    #[serde(default = "default_true")]
    pub use_executor_actor: bool,
}

fn default_parallel_workers() -> usize {
    4
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            parallel_max_workers: default_parallel_workers(),
            use_executor_actor: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.rustedloop/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `RUSTEDLOOP_API_KEY`
    /// - `RUSTEDLOOP_MODEL`
    /// - `RUSTEDLOOP_CONTEXT_WINDOW`
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if self.model.api_key.is_none() {
            self.model.api_key = lookup("RUSTEDLOOP_API_KEY");
        }

        if let Some(model) = lookup("RUSTEDLOOP_MODEL") {
            self.model.orchestration = model;
        }

        if let Some(window) = lookup("RUSTEDLOOP_CONTEXT_WINDOW") {
            self.model.context_window = window.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "RUSTEDLOOP_CONTEXT_WINDOW must be an integer, got '{window}'"
                ))
            })?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".rustedloop")
    }

    /// Get the default configuration file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.orchestration.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "model.orchestration must not be empty".into(),
            ));
        }

        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be > 0".into(),
            ));
        }

        if self.agent.loop_threshold < 2 {
            return Err(ConfigError::ValidationError(
                "agent.loop_threshold must be at least 2".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be > 0".into(),
            ));
        }

        let c = &self.compaction;
        if !(c.trigger_ratio > 0.0 && c.trigger_ratio <= 1.0) {
            return Err(ConfigError::ValidationError(
                "compaction.trigger_ratio must be in (0, 1]".into(),
            ));
        }
        if !(c.prefix_ratio > 0.0 && c.prefix_ratio < 1.0) {
            return Err(ConfigError::ValidationError(
                "compaction.prefix_ratio must be in (0, 1)".into(),
            ));
        }
        if c.min_messages <= c.keep_trailing {
            return Err(ConfigError::ValidationError(
                "compaction.min_messages must exceed compaction.keep_trailing".into(),
            ));
        }

        if self.actors.mailbox_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "actors.mailbox_capacity must be > 0".into(),
            ));
        }

        if self.tools.parallel_max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "tools.parallel_max_workers must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.model.api_key.is_some()
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Failed to write config file at {path}: {reason}")]
    WriteError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for rustedloop_core::Error {
    fn from(err: ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

//! `rustedloop config` — Configuration inspection.

use std::path::Path;

use rustedloop_config::{AppConfig, AuthorizationMode, ContinueStrategyKind, JudgeMode};

use super::load_config;

/// Settings that are valid but probably not what the user wants.
fn warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if !config.has_api_key() {
        warnings.push("No API key set (set RUSTEDLOOP_API_KEY)".to_string());
    }
    if config.model.context_window == 0 {
        warnings.push("model.context_window is 0: compaction will never trigger".to_string());
    } else if config.model.max_output_tokens as usize >= config.model.context_window {
        warnings.push("model.max_output_tokens leaves no room for input".to_string());
    }
    if !config.compaction.enabled {
        warnings.push("Compaction is disabled; long sessions will hit the window".to_string());
    }
    if config.authorization.mode == AuthorizationMode::AllowAll {
        warnings.push("authorization.mode = allow_all: every command runs without approval".to_string());
    }
    if config.agent.auto_continue == ContinueStrategyKind::LlmJudge
        && config.model.summarization.is_empty()
    {
        warnings.push(
            "auto_continue = llm_judge asks the orchestration model; set model.summarization for a cheaper judge"
                .to_string(),
        );
    }
    warnings
}

pub async fn validate(config_path: &Path) -> anyhow::Result<()> {
    println!("🔍 Validating configuration...");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e:#}");
            return Err(e);
        }
    };
    println!("   ✅ Config parsed successfully");

    let warnings = warnings(&config);
    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    let judge = match config.retry.judge {
        JudgeMode::Heuristic => "heuristic",
        JudgeMode::Llm => "llm",
    };
    println!();
    println!("   Model:          {}", config.model.orchestration);
    println!("   Summarizer:     {}", config.model.summarization_model());
    println!("   Window:         {} tokens", config.model.context_window);
    println!("   Max iterations: {}", config.agent.max_iterations);
    println!("   Auto-continue:  {:?}", config.agent.auto_continue);
    println!("   Retry:          {} attempts, {judge} judge", config.retry.max_attempts);
    println!("   Authorization:  {:?}", config.authorization.mode);

    Ok(())
}

pub async fn show(config_path: &Path) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if config.model.api_key.is_some() {
        config.model.api_key = Some("[REDACTED]".into());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub async fn path(config_path: &Path) -> anyhow::Result<()> {
    println!("{}", config_path.display());
    Ok(())
}

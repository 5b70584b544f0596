pub mod config_cmd;
pub mod estimate;
pub mod onboard;

use std::path::Path;

use anyhow::Context;
use rustedloop_config::AppConfig;

/// Load `path` with environment overrides applied, then validate.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load_from(path)?;
    config
        .apply_env_overrides(|key| std::env::var(key).ok())
        .context("Invalid environment override")?;
    config.validate()?;
    Ok(config)
}

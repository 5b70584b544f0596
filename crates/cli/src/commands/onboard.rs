//! `rustedloop onboard` — First-time setup.

use std::path::Path;

use anyhow::Context;
use rustedloop_config::AppConfig;

pub async fn run(config_path: &Path, force: bool) -> anyhow::Result<()> {
    println!("🦀 RustedLoop — First-Time Setup");
    println!("================================\n");

    if let Some(dir) = config_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        println!("✅ Created config directory: {}", dir.display());
    }

    if write_default(config_path, force)? {
        println!("✅ Created config.toml at: {}", config_path.display());
        println!("\n📝 Next steps:");
        println!("   1. Set model.orchestration and model.context_window for your model");
        println!("   2. Run: rustedloop config validate\n");
    } else {
        println!("\n⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or re-run with --force.\n");
    }

    Ok(())
}

/// Write the default config unless one exists. Returns whether it wrote.
fn write_default(config_path: &Path, force: bool) -> anyhow::Result<bool> {
    if config_path.exists() && !force {
        return Ok(false);
    }
    std::fs::write(config_path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    Ok(true)
}

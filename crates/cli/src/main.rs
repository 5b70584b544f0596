//! RustedLoop CLI.
//!
//! Commands:
//! - `onboard`  — Write the default config
//! - `config`   — Show, validate or locate the config
//! - `estimate` — Token usage of a saved transcript

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "rustedloop",
    about = "RustedLoop — agent loop engine diagnostics",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.rustedloop/config.toml
    #[arg(long, global = true, env = "RUSTEDLOOP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Onboard {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Estimate the context usage of a transcript
    Estimate {
        /// Transcript file: a JSON array of messages, or one message per line
        transcript: PathBuf,

        /// Model to count for (defaults to the configured orchestration model)
        #[arg(short, long)]
        model: Option<String>,

        /// System prompt text counted alongside the messages
        #[arg(short, long, default_value = "")]
        system: String,

        /// Print the per-message breakdown
        #[arg(long)]
        per_message: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Check the configuration for errors
    Validate,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(rustedloop_config::AppConfig::config_path);

    match cli.command {
        Commands::Onboard { force } => commands::onboard::run(&config_path, force).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(&config_path).await?,
            ConfigAction::Validate => commands::config_cmd::validate(&config_path).await?,
            ConfigAction::Path => commands::config_cmd::path(&config_path).await?,
        },
        Commands::Estimate {
            transcript,
            model,
            system,
            per_message,
        } => {
            commands::estimate::run(
                &config_path,
                &transcript,
                model.as_deref(),
                &system,
                per_message,
            )
            .await?
        }
    }

    Ok(())
}

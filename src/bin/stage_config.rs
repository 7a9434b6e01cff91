//! Config tool for the avatar stage.
//!
//! Prints the default configuration as TOML, or validates an existing file.

use anyhow::Context;
use avatar_stage::StageConfig;
use avatar_stage::diagnostics::init_tracing;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

/// Inspect and validate avatar stage configuration.
#[derive(Parser)]
#[command(name = "avatar-stage-config", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the default configuration.
    Defaults,

    /// Validate a configuration file (defaults to the user config path).
    Check {
        path: Option<PathBuf>,
    },

    /// Write the default configuration to a file.
    Init {
        path: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&StageConfig::default().logging);

    match cli.command.unwrap_or(Command::Defaults) {
        Command::Defaults => {
            let rendered = toml::to_string_pretty(&StageConfig::default())
                .context("failed to render default config")?;
            print!("{rendered}");
        }
        Command::Check { path } => {
            let path = path.unwrap_or_else(StageConfig::default_config_path);
            let config = StageConfig::from_file(&path)
                .with_context(|| format!("invalid config at {}", path.display()))?;
            info!(path = %path.display(), "config is valid");
            println!(
                "{}: ok (avatar {}, language {})",
                path.display(),
                config.session.avatar.avatar_name,
                config.session.avatar.language
            );
        }
        Command::Init { path, force } => {
            let path = path.unwrap_or_else(StageConfig::default_config_path);
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            StageConfig::default()
                .save_to_file(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}

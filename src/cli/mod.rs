//! CLI module - command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod config;
pub mod serve;
pub mod status;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use wa_crm_bridge::config::Config;

#[derive(Parser)]
#[command(name = "wa-crm-bridge")]
#[command(version)]
#[command(about = "WhatsApp connector for GoHighLevel locations", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.wa-crm-bridge/config.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connector until Ctrl+C
    Serve {
        /// Do not reconnect tenants that were connected before shutdown
        #[arg(long)]
        no_restore: bool,
    },
    /// Show tenants from the store snapshot
    Status,
    /// Inspect or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (file + environment)
    Show,
    /// Validate the configuration file
    Check,
}

pub async fn run() -> Result<()> {
    // A missing .env file is fine.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::path);

    match cli.command {
        Commands::Serve { no_restore } => {
            let config = load_config(&config_path)?;
            serve::cmd_serve(config, !no_restore).await?;
        }
        Commands::Status => {
            let config = load_config(&config_path)?;
            status::cmd_status(&config).await?;
        }
        Commands::Config { action } => {
            config::cmd_config(action, &config_path).await?;
        }
    }
    Ok(())
}

fn load_config(path: &std::path::Path) -> Result<Config> {
    Config::load_from_path(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

//! Config show/check command handlers.

use anyhow::{Context, Result};
use std::path::Path;

use wa_crm_bridge::config::Config;

use super::ConfigAction;

pub(crate) async fn cmd_config(action: ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let mut config = Config::load_from_path(path)
                .with_context(|| "Failed to load configuration")?;
            // Never print CRM tokens.
            for token in config.crm.access_tokens.values_mut() {
                *token = "***".to_string();
            }
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Check => {
            println!("Config file: {}", path.display());

            if !path.exists() {
                println!("[OK] No config file found (using defaults)");
            } else {
                let content =
                    std::fs::read_to_string(path).context("Failed to read config file")?;
                if let Err(e) = serde_json::from_str::<serde_json::Value>(&content) {
                    println!("[ERROR] Invalid JSON: {}", e);
                    return Ok(());
                }
            }

            let config = match Config::load_from_path(path) {
                Ok(c) => c,
                Err(e) => {
                    println!("[ERROR] {}", e);
                    return Ok(());
                }
            };

            match config.validate() {
                Ok(()) => println!("\nConfiguration looks good!"),
                Err(e) => println!("[ERROR] {}", e),
            }
            if config.crm.access_tokens.is_empty() {
                println!("[WARN] crm.access_tokens is empty; CRM sync is disabled");
            }
            if config.storage.path.is_none() {
                println!("[WARN] storage.path is unset; state is lost on restart");
            }
        }
    }
    Ok(())
}

//! Configuration management for wa-crm-bridge
//!
//! Configuration is loaded from `~/.wa-crm-bridge/config.json` with environment
//! variable overrides (`WACRM_SECTION_KEY`).

mod types;

pub use types::*;

use crate::error::{ConnectorError, Result};
use std::path::{Path, PathBuf};

impl Config {
    /// Returns the configuration directory path (~/.wa-crm-bridge)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wa-crm-bridge")
    }

    /// Returns the path to the config file (~/.wa-crm-bridge/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: WACRM_SECTION_KEY
    fn apply_env_overrides(&mut self) {
        // Session
        if let Ok(val) = std::env::var("WACRM_SESSION_BRIDGE_URL") {
            self.session.bridge_url = val;
        }
        if let Ok(val) = std::env::var("WACRM_SESSION_REQUEST_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.session.request_timeout_secs = v;
            }
        }

        // Queue
        if let Ok(val) = std::env::var("WACRM_QUEUE_MAX_ATTEMPTS") {
            if let Ok(v) = val.parse() {
                self.queue.max_attempts = v;
            }
        }
        if let Ok(val) = std::env::var("WACRM_QUEUE_DELAY_BETWEEN_MESSAGES_MS") {
            if let Ok(v) = val.parse() {
                self.queue.default_rate_limit.delay_between_messages_ms = v;
            }
        }
        if let Ok(val) = std::env::var("WACRM_QUEUE_JITTER_MS") {
            if let Ok(v) = val.parse() {
                self.queue.default_rate_limit.jitter_ms = v;
            }
        }

        // Identity / origin / lifecycle
        if let Ok(val) = std::env::var("WACRM_IDENTITY_CANDIDATE_WINDOW_SECS") {
            if let Ok(v) = val.parse() {
                self.identity.candidate_window_secs = v;
            }
        }
        if let Ok(val) = std::env::var("WACRM_ORIGIN_TTL_SECS") {
            if let Ok(v) = val.parse() {
                self.origin.ttl_secs = v;
            }
        }
        if let Ok(val) = std::env::var("WACRM_LIFECYCLE_RECONNECT_DELAY_SECS") {
            if let Ok(v) = val.parse() {
                self.lifecycle.reconnect_delay_secs = v;
            }
        }

        // CRM
        if let Ok(val) = std::env::var("WACRM_CRM_API_BASE") {
            self.crm.api_base = val;
        }

        // Storage / logging
        if let Ok(val) = std::env::var("WACRM_STORAGE_PATH") {
            self.storage.path = Some(val);
        }
        if let Ok(val) = std::env::var("WACRM_STORAGE_MAX_MESSAGES") {
            if let Ok(v) = val.parse() {
                self.storage.max_messages = v;
            }
        }
        if let Ok(val) = std::env::var("WACRM_LOGGING_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values that would make the connector misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let url = self.session.bridge_url.trim();
        if url.is_empty() {
            problems.push("session.bridge_url is empty".to_string());
        } else if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            problems.push(format!("session.bridge_url must be ws:// or wss://, got {}", url));
        }
        if self.queue.max_attempts == 0 {
            problems.push("queue.max_attempts must be at least 1".to_string());
        }
        if self.origin.ttl_secs == 0 {
            problems.push("origin.ttl_secs must be at least 1".to_string());
        }
        if self.origin.sweep_interval_secs == 0 {
            problems.push("origin.sweep_interval_secs must be at least 1".to_string());
        }
        if !self.crm.api_base.starts_with("http") {
            problems.push(format!("crm.api_base is not an http(s) URL: {}", self.crm.api_base));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConnectorError::Config(problems.join("; ")))
        }
    }

    /// Snapshot file path with `~` expanded, if persistence is configured.
    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage.path.as_deref().map(expand_home)
    }
}

/// Expand ~ to home directory in a path string
fn expand_home(path: &str) -> PathBuf {
    if path.is_empty() {
        return PathBuf::from(path);
    }

    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            if path.len() > 1 && path.chars().nth(1) == Some('/') {
                return home.join(&path[2..]);
            }
            return home;
        }
    }

    PathBuf::from(path)
}

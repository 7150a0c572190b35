//! Configuration type definitions for wa-crm-bridge
//!
//! All types implement serde traits for JSON serialization and have sensible defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// WhatsApp session bridge connection
    pub session: SessionConfig,
    /// Outbound delivery queue (drip mode)
    pub queue: QueueConfig,
    /// LID resolution policy
    pub identity: IdentityConfig,
    /// Origin mark expiry
    pub origin: OriginConfig,
    /// Connection lifecycle timings
    pub lifecycle: LifecycleConfig,
    /// CRM API client
    pub crm: CrmConfig,
    /// Tenant webhook dispatcher
    pub webhook: WebhookConfig,
    /// Persistence
    pub storage: StorageConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// WhatsApp session bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket URL of the session bridge
    pub bridge_url: String,
    /// Seconds to wait for a bridge response before failing the request
    pub request_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bridge_url: "ws://localhost:3001".to_string(),
            request_timeout_secs: 30,
        }
    }
}

// ============================================================================
// Queue Configuration
// ============================================================================

/// Per-tenant drip-mode rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// When false, messages are sent back-to-back (still serialized).
    pub enabled: bool,
    /// Minimum gap between two sends for the same tenant.
    pub delay_between_messages_ms: u64,
    /// Random extra delay in `[0, jitter_ms)` added on top of the base gap.
    pub jitter_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_between_messages_ms: 1_000,
            jitter_ms: 4_000,
        }
    }
}

/// Outbound delivery queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Total send attempts per entry before it is dropped.
    pub max_attempts: u32,
    /// Rate limit applied to tenants without an override.
    pub default_rate_limit: RateLimitConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_rate_limit: RateLimitConfig::default(),
        }
    }
}

// ============================================================================
// Identity / Origin / Lifecycle
// ============================================================================

/// LID resolution policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Trailing window in which an unmapped phone row may absorb an unknown LID.
    pub candidate_window_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            candidate_window_secs: 300,
        }
    }
}

/// Origin mark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// How long a system-initiated send suppresses its own echo.
    pub ttl_secs: u64,
    /// How often expired marks are swept.
    pub sweep_interval_secs: u64,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            sweep_interval_secs: 10,
        }
    }
}

/// Connection lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Fixed delay before reconnecting after a recoverable drop.
    pub reconnect_delay_secs: u64,
    /// Reconnect tenants persisted as connected when the service starts.
    pub restore_on_startup: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            restore_on_startup: true,
        }
    }
}

// ============================================================================
// CRM / Webhook
// ============================================================================

/// CRM (LeadConnector) API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrmConfig {
    /// API base URL
    pub api_base: String,
    /// Value of the `Version` header
    pub api_version: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Location id → access token. Token refresh is handled outside the connector.
    pub access_tokens: HashMap<String, String>,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://services.leadconnectorhq.com".to_string(),
            api_version: "2021-07-28".to_string(),
            timeout_secs: 30,
            access_tokens: HashMap::new(),
        }
    }
}

/// Tenant webhook dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Whether webhooks are dispatched at all
    pub enabled: bool,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Consecutive failures after which a tenant's webhook is disabled
    pub max_consecutive_failures: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 10,
            max_consecutive_failures: 10,
        }
    }
}

// ============================================================================
// Storage / Logging
// ============================================================================

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot file. `None` keeps everything in memory.
    pub path: Option<String>,
    /// Message records kept before the oldest are pruned (0 = unlimited)
    pub max_messages: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_messages: 50_000,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, coloured
    Pretty,
    /// Compact `[LEVEL] target message {fields}` lines
    #[default]
    Component,
    /// JSON lines for log aggregators
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Optional file to append JSON logs to
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            level: "info".to_string(),
            file: None,
        }
    }
}

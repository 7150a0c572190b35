//! Persisted data model: tenants, identity mappings and message records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::RateLimitConfig;

/// Connection state of a tenant's WhatsApp session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    QrReady,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::QrReady => "qr_ready",
            ConnectionStatus::Connected => "connected",
        }
    }

    /// States that only make sense while a live session object exists.
    pub fn needs_live_session(&self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::QrReady)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where tenant webhooks are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    /// HMAC-SHA256 signing secret
    pub secret: String,
}

/// One WhatsApp-session-to-CRM-location binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAccount {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: ConnectionStatus,
    /// Canonical phone of the connected WhatsApp account
    #[serde(default)]
    pub phone_number: Option<String>,
    /// CRM location this tenant syncs into
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub is_paid: bool,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub webhook: Option<WebhookTarget>,
    /// Per-tenant drip override
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl SubAccount {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            status: ConnectionStatus::Disconnected,
            phone_number: None,
            location_id: None,
            is_active: true,
            is_paid: true,
            last_connected_at: None,
            webhook: None,
            rate_limit: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_location(mut self, location_id: &str) -> Self {
        self.location_id = Some(location_id.to_string());
        self
    }

    pub fn with_webhook(mut self, url: &str, secret: &str) -> Self {
        self.webhook = Some(WebhookTarget {
            url: url.to_string(),
            secret: secret.to_string(),
        });
        self
    }
}

/// Cached link between a contact's phone and its opaque WhatsApp id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatsAppMapping {
    pub tenant_id: String,
    /// Canonical phone, digits only
    pub phone_number: String,
    /// Opaque LID user part, once learned
    pub whatsapp_id: Option<String>,
    pub contact_name: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// Partial update applied to the (tenant, phone) mapping row.
///
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct MappingUpsert {
    pub tenant_id: String,
    pub phone_number: String,
    pub whatsapp_id: Option<String>,
    pub contact_name: Option<String>,
}

impl MappingUpsert {
    pub fn new(tenant_id: &str, phone_number: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            phone_number: phone_number.to_string(),
            ..Default::default()
        }
    }

    pub fn whatsapp_id(mut self, id: &str) -> Self {
        self.whatsapp_id = Some(id.to_string());
        self
    }

    pub fn contact_name(mut self, name: Option<&str>) -> Self {
        self.contact_name = name.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Content kind of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Document,
    Audio,
    Video,
    Sticker,
    Contact,
    Location,
    Unknown,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::Document => "document",
            ContentKind::Audio => "audio",
            ContentKind::Video => "video",
            ContentKind::Sticker => "sticker",
            ContentKind::Contact => "contact",
            ContentKind::Location => "location",
            ContentKind::Unknown => "unknown",
        }
    }

    /// Parse an API-supplied type name. Unrecognized names are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "sms" => Some(ContentKind::Text),
            "image" => Some(ContentKind::Image),
            "document" | "file" => Some(ContentKind::Document),
            "audio" => Some(ContentKind::Audio),
            "video" => Some(ContentKind::Video),
            "sticker" => Some(ContentKind::Sticker),
            "contact" => Some(ContentKind::Contact),
            "location" => Some(ContentKind::Location),
            _ => None,
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self,
            ContentKind::Image
                | ContentKind::Document
                | ContentKind::Audio
                | ContentKind::Video
                | ContentKind::Sticker
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Received,
    Sent,
    Failed,
}

/// Append-only record of a processed WhatsApp event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub tenant_id: String,
    /// Provider message id; unique per tenant
    pub message_id: String,
    pub direction: Direction,
    pub from_number: String,
    pub to_number: String,
    pub content_kind: ContentKind,
    pub content: String,
    pub status: DeliveryStatus,
    /// Raw provider payload and other details, kept for decrypt-retry replay
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(
        tenant_id: &str,
        message_id: &str,
        direction: Direction,
        content_kind: ContentKind,
        content: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            message_id: message_id.to_string(),
            direction,
            from_number: String::new(),
            to_number: String::new(),
            content_kind,
            content: content.to_string(),
            status: match direction {
                Direction::Inbound => DeliveryStatus::Received,
                Direction::Outbound => DeliveryStatus::Sent,
            },
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_numbers(mut self, from: &str, to: &str) -> Self {
        self.from_number = from.to_string();
        self.to_number = to.to_string();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Raw provider payload, if one was retained.
    pub fn raw_payload(&self) -> Option<&serde_json::Value> {
        self.metadata.get("raw")
    }
}

//! Session module - the WhatsApp side of the connector
//!
//! The WhatsApp wire protocol lives outside this crate. The connector talks to
//! it through [`SessionClient`] for commands and receives everything the
//! session reports as [`SessionEvent`]s on an mpsc channel handed to the
//! client at construction.
//!
//! [`bridge::BridgeSessionClient`] is the production implementation: JSON
//! frames over a WebSocket to an external bridge process.

pub mod bridge;

pub use bridge::BridgeSessionClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::RawEvent;
use crate::error::{Result, SessionError};
use crate::identity::Jid;
use crate::store::ContentKind;

/// Something the session reports for one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub tenant_id: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// New pairing QR; replaces any previous one
    Qr(String),
    /// Session authenticated as `phone` (the account's own number)
    Open { phone: String },
    /// Session dropped
    Close(SessionError),
    Message(RawEvent),
    /// The recipient could not decrypt `message_id` and asks for it again
    RetryRequest { message_id: String },
}

impl SessionEvent {
    pub fn new(tenant_id: &str, kind: SessionEventKind) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            kind,
        }
    }
}

/// What to put on the wire for one send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPayload {
    Text {
        text: String,
    },
    Media {
        kind: ContentKind,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

impl OutboundPayload {
    /// Build a payload from API-level fields. A media kind without a URL is
    /// sent as text.
    pub fn from_parts(
        kind: ContentKind,
        content: &str,
        media_url: Option<&str>,
        filename: Option<&str>,
    ) -> Self {
        match media_url {
            Some(url) if kind.is_media() || kind == ContentKind::Text => OutboundPayload::Media {
                // A bare URL on a text message is treated as a document
                kind: if kind == ContentKind::Text {
                    ContentKind::Document
                } else {
                    kind
                },
                url: url.to_string(),
                caption: Some(content.to_string()).filter(|c| !c.trim().is_empty()),
                filename: filename.map(str::to_string),
            },
            _ => OutboundPayload::Text {
                text: content.to_string(),
            },
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            OutboundPayload::Text { .. } => ContentKind::Text,
            OutboundPayload::Media { kind, .. } => *kind,
        }
    }
}

/// Commands the connector sends to a tenant's WhatsApp session.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Start (or restart) the tenant's session. Progress arrives as events.
    async fn connect(&self, tenant_id: &str) -> Result<()>;

    /// Close the session. With `logout`, stored credentials are wiped and the
    /// next connect needs a fresh QR scan.
    async fn disconnect(&self, tenant_id: &str, logout: bool) -> Result<()>;

    /// Send one message. Returns the provider message id.
    async fn send(&self, tenant_id: &str, to: &Jid, payload: &OutboundPayload) -> Result<String>;

    /// Ask the session's directory for the opaque id behind a phone number.
    async fn lookup_identifier(&self, tenant_id: &str, phone: &str) -> Result<Option<String>>;

    /// Answer a retry request with the stored raw payload.
    async fn replay(&self, tenant_id: &str, message_id: &str, payload: &Value) -> Result<()>;
}

/// Map a bridge error kind to a [`SessionError`].
pub fn classify_session_error(kind: &str, message: &str) -> SessionError {
    let msg = message.to_string();
    match kind.to_ascii_lowercase().as_str() {
        "network" | "connection_closed" | "connection_lost" => SessionError::Network(msg),
        "timeout" | "timed_out" => SessionError::Timeout(msg),
        "logged_out" | "logout" | "unauthorized" => SessionError::LoggedOut(msg),
        "replaced" | "conflict" => SessionError::Replaced(msg),
        "rejected" | "bad_request" | "not_on_whatsapp" => SessionError::Rejected(msg),
        _ => SessionError::Unknown(msg),
    }
}

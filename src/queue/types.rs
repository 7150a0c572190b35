//! Outbound queue entries and status snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RateLimitConfig;
use crate::store::ContentKind;

/// One pending outbound message. Lives in memory only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: String,
    pub tenant_id: String,
    /// Destination phone, digits only
    pub to: String,
    pub content: String,
    pub kind: ContentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Failed send attempts so far
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(tenant_id: &str, to: &str, content: &str, kind: ContentKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            to: to.to_string(),
            content: content.to_string(),
            kind,
            media_url: None,
            filename: None,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_media(mut self, url: &str, filename: Option<&str>) -> Self {
        self.media_url = Some(url.to_string());
        self.filename = filename.map(str::to_string);
        self
    }
}

/// Per-tenant worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Idle,
    Processing,
    Paused,
}

/// Pending entry as reported by [`QueueStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEntry {
    pub id: String,
    pub to: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl From<&QueueEntry> for PendingEntry {
    fn from(e: &QueueEntry) -> Self {
        Self {
            id: e.id.clone(),
            to: e.to.clone(),
            enqueued_at: e.enqueued_at,
            attempts: e.attempts,
        }
    }
}

/// Snapshot of one tenant's queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub tenant_id: String,
    pub state: QueueState,
    /// Pending entries, not counting the one in flight
    pub length: usize,
    pub processing: bool,
    pub paused: bool,
    pub rate_limit: RateLimitConfig,
    pub pending: Vec<PendingEntry>,
}

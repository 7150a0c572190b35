//! Classifier module - sort raw session events before anything acts on them
//!
//! Every message event is checked in a fixed order:
//!
//! 1. chat type: broadcast, status, newsletter and group chats are dropped
//! 2. decryption: an event without a payload is dropped and counted, never
//!    stored, so a successful retry of the same id is not seen as a replay
//! 3. noise: reactions and protocol housekeeping are dropped
//! 4. dedup: an id already stored for the tenant is a replay
//! 5. direction: `from_me` events are outbound, everything else inbound
//!
//! The classifier itself writes nothing. Persisting the record is what marks
//! an id as seen.

pub mod content;

pub use content::{MessageContent, RawEvent};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::identity::{Jid, JidServer};
use crate::store::{Direction, Store};
use crate::utils::string::preview;

/// Why an event was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// `status@broadcast` or a broadcast list
    Broadcast,
    Newsletter,
    Group,
    /// Chat id could not be parsed
    InvalidJid,
    Reaction,
    /// Revokes, key distribution and similar housekeeping
    Protocol,
    DecryptFailed,
    /// Same provider id already stored for this tenant
    Duplicate,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::Broadcast => "broadcast",
            DropReason::Newsletter => "newsletter",
            DropReason::Group => "group",
            DropReason::InvalidJid => "invalid_jid",
            DropReason::Reaction => "reaction",
            DropReason::Protocol => "protocol",
            DropReason::DecryptFailed => "decrypt_failed",
            DropReason::Duplicate => "duplicate",
        };
        f.write_str(s)
    }
}

/// An event that survived classification.
#[derive(Debug, Clone)]
pub struct ClassifiedMessage {
    pub tenant_id: String,
    pub event: RawEvent,
    /// The other party of the 1:1 chat
    pub contact: Jid,
    pub content: MessageContent,
    pub direction: Direction,
}

#[derive(Debug, Clone)]
pub enum Classification {
    Drop(DropReason),
    Inbound(ClassifiedMessage),
    Outbound(ClassifiedMessage),
}

impl Classification {
    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Classification::Drop(r) => Some(*r),
            _ => None,
        }
    }
}

/// Stateless apart from the per-tenant decrypt failure counters.
pub struct MessageClassifier {
    store: Arc<dyn Store>,
    decrypt_failures: Mutex<HashMap<String, u64>>,
}

impl MessageClassifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            decrypt_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Classify one message event for `tenant_id`.
    pub async fn classify(&self, tenant_id: &str, event: RawEvent) -> Result<Classification> {
        let Some(contact) = Jid::parse(&event.remote_jid) else {
            debug!("Tenant {}: unparseable chat id {:?}", tenant_id, event.remote_jid);
            return Ok(Classification::Drop(DropReason::InvalidJid));
        };
        if contact.is_broadcast_like() {
            let reason = if contact.server == JidServer::Newsletter {
                DropReason::Newsletter
            } else {
                DropReason::Broadcast
            };
            return Ok(Classification::Drop(reason));
        }
        if contact.is_group() {
            return Ok(Classification::Drop(DropReason::Group));
        }

        if event.is_undecryptable() {
            let count = self.record_decrypt_failure(tenant_id);
            error!(
                "Tenant {}: message {} from {} could not be decrypted ({} so far)",
                tenant_id, event.id, contact, count
            );
            return Ok(Classification::Drop(DropReason::DecryptFailed));
        }

        // Decrypt failures return above, so `message` is present here.
        let content = event
            .message
            .as_ref()
            .map(MessageContent::decode)
            .unwrap_or(MessageContent::Unknown { keys: Vec::new() });
        if content.is_noise() {
            let reason = if matches!(content, MessageContent::Reaction) {
                DropReason::Reaction
            } else {
                DropReason::Protocol
            };
            return Ok(Classification::Drop(reason));
        }

        if self.store.has_message(tenant_id, &event.id).await? {
            debug!("Tenant {}: replay of {} dropped", tenant_id, event.id);
            return Ok(Classification::Drop(DropReason::Duplicate));
        }

        if let MessageContent::Unknown { keys } = &content {
            warn!(
                "Tenant {}: unrecognized payload in {} (keys: {})",
                tenant_id,
                event.id,
                keys.join(", ")
            );
        } else {
            debug!(
                "Tenant {}: {} {} \"{}\"",
                tenant_id,
                if event.from_me { "outbound" } else { "inbound" },
                content.kind().as_str(),
                preview(&content.body(), 40)
            );
        }

        let direction = if event.from_me {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        let msg = ClassifiedMessage {
            tenant_id: tenant_id.to_string(),
            event,
            contact,
            content,
            direction,
        };
        Ok(match direction {
            Direction::Inbound => Classification::Inbound(msg),
            Direction::Outbound => Classification::Outbound(msg),
        })
    }

    fn record_decrypt_failure(&self, tenant_id: &str) -> u64 {
        let mut counts = self.decrypt_failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(tenant_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Number of undecryptable events seen for a tenant since startup.
    pub fn decrypt_failures(&self, tenant_id: &str) -> u64 {
        let counts = self.decrypt_failures.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(tenant_id).copied().unwrap_or(0)
    }

    pub fn remove_tenant(&self, tenant_id: &str) {
        let mut counts = self.decrypt_failures.lock().unwrap_or_else(|e| e.into_inner());
        counts.remove(tenant_id);
    }
}

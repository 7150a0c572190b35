//! CRM module - where resolved conversations end up
//!
//! The connector only needs four things from the CRM: find or create a contact
//! by phone, find or create that contact's conversation, append a message to
//! it, and (for unresolved senders) look a contact up by display name.
//! [`ghl::GhlClient`] implements them against the LeadConnector v2 REST API.

pub mod ghl;

pub use ghl::GhlClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Direction;

/// A CRM contact as far as the connector cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmContact {
    pub id: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Contact details used when a contact has to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactLookup {
    /// Canonical phone, digits only
    pub phone: String,
    pub name: Option<String>,
}

impl ContactLookup {
    pub fn new(phone: &str, name: Option<&str>) -> Self {
        Self {
            phone: phone.to_string(),
            name: name.map(str::to_string),
        }
    }
}

/// One message mirrored into a CRM conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct CrmMessage {
    pub conversation_id: String,
    pub contact_id: String,
    pub direction: Direction,
    pub body: String,
    pub attachments: Vec<String>,
    /// WhatsApp message id, kept as the CRM's external id
    pub provider_message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn find_or_create_contact(
        &self,
        location_id: &str,
        contact: &ContactLookup,
    ) -> Result<CrmContact>;

    /// Returns the conversation id.
    async fn find_or_create_conversation(&self, location_id: &str, contact_id: &str)
        -> Result<String>;

    /// Returns the CRM message id.
    async fn post_message(&self, location_id: &str, message: &CrmMessage) -> Result<String>;

    /// Contact whose name matches exactly one record, if any.
    async fn find_contact_by_name(
        &self,
        _location_id: &str,
        _name: &str,
    ) -> Result<Option<CrmContact>> {
        Ok(None)
    }
}

//! LeadConnector (GoHighLevel) v2 REST client.
//!
//! Tokens are looked up per location from `crm.access_tokens`; obtaining and
//! refreshing them is outside the connector.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{ContactLookup, CrmClient, CrmContact, CrmMessage};
use crate::config::CrmConfig;
use crate::error::{ConnectorError, Result};
use crate::log_component;
use crate::store::Direction;
use crate::utils::string::{mask_phone, preview};

/// Message type the CRM shows for our conversations.
const MESSAGE_TYPE: &str = "SMS";

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiContact {
    id: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default, rename = "contactName")]
    contact_name: Option<String>,
    #[serde(default, rename = "firstName")]
    first_name: Option<String>,
    #[serde(default, rename = "lastName")]
    last_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl From<ApiContact> for CrmContact {
    fn from(c: ApiContact) -> Self {
        let joined = match (c.first_name, c.last_name) {
            (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
            (Some(f), None) => Some(f),
            (None, Some(l)) => Some(l),
            (None, None) => None,
        };
        CrmContact {
            id: c.id,
            phone: c.phone,
            name: c.contact_name.or(c.name).or(joined),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContactEnvelope {
    #[serde(default)]
    contact: Option<ApiContact>,
}

#[derive(Debug, Deserialize)]
struct ContactsEnvelope {
    #[serde(default)]
    contacts: Vec<ApiContact>,
}

#[derive(Debug, Deserialize)]
struct ApiConversation {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ConversationEnvelope {
    conversation: ApiConversation,
}

#[derive(Debug, Deserialize)]
struct ConversationsEnvelope {
    #[serde(default)]
    conversations: Vec<ApiConversation>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default, rename = "messageId")]
    message_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateContact<'a> {
    location_id: &'a str,
    phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    source: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversation<'a> {
    location_id: &'a str,
    contact_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    conversation_id: &'a str,
    contact_id: &'a str,
    message: &'a str,
    direction: &'a str,
    #[serde(skip_serializing_if = "no_attachments")]
    attachments: &'a [String],
    alt_id: &'a str,
    date: String,
}

fn no_attachments(a: &&[String]) -> bool {
    a.is_empty()
}

/// E.164 form the CRM stores.
fn e164(phone: &str) -> String {
    format!("+{}", phone.trim_start_matches('+'))
}

// ---------------------------------------------------------------------------
// GhlClient
// ---------------------------------------------------------------------------

pub struct GhlClient {
    client: Client,
    config: CrmConfig,
}

impl GhlClient {
    pub fn new(config: CrmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self { client, config })
    }

    fn token(&self, location_id: &str) -> Result<&str> {
        self.config
            .access_tokens
            .get(location_id)
            .map(String::as_str)
            .ok_or_else(|| {
                ConnectorError::Crm(format!("no access token for location {}", location_id))
            })
    }

    fn request(&self, method: Method, path: &str, location_id: &str) -> Result<RequestBuilder> {
        let token = self.token(location_id)?;
        Ok(self
            .client
            .request(method, format!("{}{}", self.config.api_base.trim_end_matches('/'), path))
            .header("Authorization", format!("Bearer {}", token))
            .header("Version", &self.config.api_version)
            .header("Accept", "application/json"))
    }

    async fn execute<T: DeserializeOwned>(&self, what: &str, req: RequestBuilder) -> Result<T> {
        let response = req
            .send()
            .await
            .map_err(|e| ConnectorError::Crm(format!("{} request failed: {}", what, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Crm(format!(
                "{} failed ({}): {}",
                what,
                status,
                preview(&error_text, 200)
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ConnectorError::Crm(format!("failed to parse {} response: {}", what, e)))
    }

    async fn search_contact_by_phone(
        &self,
        location_id: &str,
        phone: &str,
    ) -> Result<Option<CrmContact>> {
        let req = self
            .request(Method::GET, "/contacts/search/duplicate", location_id)?
            .query(&[("locationId", location_id), ("number", e164(phone).as_str())]);
        let found: ContactEnvelope = self.execute("contact search", req).await?;
        Ok(found.contact.map(CrmContact::from))
    }
}

#[async_trait]
impl CrmClient for GhlClient {
    async fn find_or_create_contact(
        &self,
        location_id: &str,
        contact: &ContactLookup,
    ) -> Result<CrmContact> {
        if let Some(existing) = self.search_contact_by_phone(location_id, &contact.phone).await? {
            return Ok(existing);
        }

        let body = CreateContact {
            location_id,
            phone: e164(&contact.phone),
            name: contact.name.as_deref(),
            source: "WhatsApp",
        };
        let req = self.request(Method::POST, "/contacts/", location_id)?.json(&body);
        let created: ContactEnvelope = self.execute("contact create", req).await?;
        let created = created
            .contact
            .map(CrmContact::from)
            .ok_or_else(|| ConnectorError::Crm("contact create returned no contact".to_string()))?;
        info!(
            "CRM contact {} created for {} in location {}",
            created.id,
            mask_phone(&contact.phone),
            location_id
        );
        Ok(created)
    }

    async fn find_or_create_conversation(
        &self,
        location_id: &str,
        contact_id: &str,
    ) -> Result<String> {
        let req = self
            .request(Method::GET, "/conversations/search", location_id)?
            .query(&[("locationId", location_id), ("contactId", contact_id)]);
        let found: ConversationsEnvelope = self.execute("conversation search", req).await?;
        if let Some(conv) = found.conversations.into_iter().next() {
            return Ok(conv.id);
        }

        let req = self
            .request(Method::POST, "/conversations/", location_id)?
            .json(&CreateConversation {
                location_id,
                contact_id,
            });
        let created: ConversationEnvelope = self.execute("conversation create", req).await?;
        debug!("CRM conversation {} created for contact {}", created.conversation.id, contact_id);
        Ok(created.conversation.id)
    }

    async fn post_message(&self, location_id: &str, message: &CrmMessage) -> Result<String> {
        let path = match message.direction {
            Direction::Inbound => "/conversations/messages/inbound",
            Direction::Outbound => "/conversations/messages/outbound",
        };
        let body = PostMessage {
            kind: MESSAGE_TYPE,
            conversation_id: &message.conversation_id,
            contact_id: &message.contact_id,
            message: &message.body,
            direction: message.direction.as_str(),
            attachments: &message.attachments,
            alt_id: &message.provider_message_id,
            date: message.timestamp.to_rfc3339(),
        };
        let req = self.request(Method::POST, path, location_id)?.json(&body);
        let resp: MessageResponse = self.execute("message post", req).await?;
        log_component!(
            debug,
            "crm",
            "message mirrored",
            location = location_id,
            direction = message.direction.as_str()
        );
        Ok(resp.message_id.or(resp.id).unwrap_or_default())
    }

    async fn find_contact_by_name(
        &self,
        location_id: &str,
        name: &str,
    ) -> Result<Option<CrmContact>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        let req = self
            .request(Method::GET, "/contacts/", location_id)?
            .query(&[("locationId", location_id), ("query", name)]);
        let found: ContactsEnvelope = self.execute("contact name search", req).await?;

        let mut exact: Vec<CrmContact> = found
            .contacts
            .into_iter()
            .map(CrmContact::from)
            .filter(|c| {
                c.name
                    .as_deref()
                    .is_some_and(|n| n.trim().eq_ignore_ascii_case(name))
            })
            .collect();
        if exact.len() == 1 {
            Ok(exact.pop())
        } else {
            debug!(
                "CRM name search for {:?} matched {} contacts, not using it",
                name,
                exact.len()
            );
            Ok(None)
        }
    }
}

//! Identity module - resolve WhatsApp contact identifiers to phone numbers
//!
//! WhatsApp addresses a contact either by a phone JID
//! (`393806510543@s.whatsapp.net`) or by an opaque LID (`250830569660605@lid`)
//! that says nothing about the number behind it. The CRM only understands
//! phone numbers, so every event passes through [`IdentityResolver::resolve`]:
//!
//! 1. canonical phone JID, not flagged opaque → used directly
//! 2. known opaque id → phone from the mapping table
//! 3. unknown opaque id → bound to the single unmapped row active inside the
//!    candidate window, if there is exactly one
//! 4. a protocol-level answer (alternate phone on the event, or a directory
//!    lookup before sending) beats step 3 and is persisted immediately
//!
//! Anything else stays [`Resolution::Unresolved`]. Guessing would attach a
//! message to the wrong CRM contact.

pub mod jid;

pub use jid::{is_canonical_phone, normalize_phone, Jid, JidServer};

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::log_component;
use crate::store::{MappingUpsert, Store};
use crate::utils::string::mask_phone;

/// How a phone number was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// The identifier itself was a phone number
    Direct,
    /// Stored opaque id → phone mapping
    Mapping,
    /// Phone supplied by the session alongside the opaque id
    Protocol,
    /// Bound to the only recently active unmapped row
    RecentCandidate,
}

/// Outcome of resolving one contact identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved {
        phone: String,
        name: Option<String>,
        source: ResolutionSource,
    },
    Unresolved {
        /// The raw opaque id, kept as a non-routable stand-in
        placeholder: String,
        /// Number of candidate rows seen in the window (0 or ≥ 2)
        candidates: usize,
    },
}

impl Resolution {
    pub fn phone(&self) -> Option<&str> {
        match self {
            Resolution::Resolved { phone, .. } => Some(phone),
            Resolution::Unresolved { .. } => None,
        }
    }

    /// Phone if resolved, otherwise the placeholder.
    pub fn display_number(&self) -> &str {
        match self {
            Resolution::Resolved { phone, .. } => phone,
            Resolution::Unresolved { placeholder, .. } => placeholder,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }
}

/// Everything the resolver needs to know about one event's contact.
#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    pub tenant_id: &'a str,
    pub contact: &'a Jid,
    /// The event explicitly marked the identifier as opaque
    pub opaque_hint: bool,
    /// Phone the session paired with this identifier, if any
    pub alt_phone: Option<&'a str>,
    /// Display name carried by the event
    pub push_name: Option<&'a str>,
    /// Outbound echo of our own account: the push name is the sender's, not the contact's
    pub self_echo: bool,
}

impl<'a> ResolveRequest<'a> {
    pub fn new(tenant_id: &'a str, contact: &'a Jid) -> Self {
        Self {
            tenant_id,
            contact,
            opaque_hint: false,
            alt_phone: None,
            push_name: None,
            self_echo: false,
        }
    }

    /// Name that may be written to the mapping row.
    fn contact_name(&self) -> Option<&'a str> {
        if self.self_echo {
            None
        } else {
            self.push_name.filter(|n| !n.trim().is_empty())
        }
    }
}

/// Maps contact identifiers to canonical phone numbers using the mapping table.
pub struct IdentityResolver {
    store: Arc<dyn Store>,
    candidate_window: Duration,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn Store>, candidate_window_secs: u64) -> Self {
        Self {
            store,
            candidate_window: Duration::seconds(candidate_window_secs as i64),
        }
    }

    /// Resolve the contact of one event. See the module docs for the order.
    pub async fn resolve(&self, req: &ResolveRequest<'_>) -> Result<Resolution> {
        let tenant = req.tenant_id;
        let raw = &req.contact.user;

        // 1. Plain phone JID.
        if !req.contact.is_lid() && !req.opaque_hint && is_canonical_phone(raw) {
            let row = self
                .store
                .upsert_mapping(MappingUpsert::new(tenant, raw).contact_name(req.contact_name()))
                .await?;
            return Ok(Resolution::Resolved {
                phone: raw.clone(),
                name: row.contact_name.or_else(|| req.contact_name().map(str::to_string)),
                source: ResolutionSource::Direct,
            });
        }

        // 4 (inbound half). The session told us the phone behind this id.
        if let Some(alt) = req.alt_phone.map(normalize_phone) {
            if is_canonical_phone(&alt) {
                let row = self
                    .store
                    .upsert_mapping(
                        MappingUpsert::new(tenant, &alt)
                            .whatsapp_id(raw)
                            .contact_name(req.contact_name()),
                    )
                    .await?;
                log_component!(
                    debug,
                    "identity",
                    "bound opaque id from protocol hint",
                    tenant = tenant,
                    phone = mask_phone(&alt).as_str()
                );
                return Ok(Resolution::Resolved {
                    phone: alt,
                    name: row.contact_name,
                    source: ResolutionSource::Protocol,
                });
            }
        }

        // 2. Known opaque id.
        if let Some(row) = self.store.find_mapping_by_whatsapp_id(tenant, raw).await? {
            let row = self
                .store
                .upsert_mapping(
                    MappingUpsert::new(tenant, &row.phone_number).contact_name(req.contact_name()),
                )
                .await?;
            return Ok(Resolution::Resolved {
                phone: row.phone_number,
                name: row.contact_name,
                source: ResolutionSource::Mapping,
            });
        }

        // 3. Single recently active unmapped row.
        let since = Utc::now() - self.candidate_window;
        let candidates = self.store.unmapped_mappings_since(tenant, since).await?;
        if candidates.len() == 1 {
            let phone = candidates[0].phone_number.clone();
            let row = self
                .store
                .upsert_mapping(
                    MappingUpsert::new(tenant, &phone)
                        .whatsapp_id(raw)
                        .contact_name(req.contact_name()),
                )
                .await?;
            info!(
                "Tenant {}: bound opaque id {} to recent contact {}",
                tenant,
                raw,
                mask_phone(&phone)
            );
            return Ok(Resolution::Resolved {
                phone,
                name: row.contact_name,
                source: ResolutionSource::RecentCandidate,
            });
        }

        if candidates.is_empty() {
            debug!(
                "Tenant {}: opaque id {} has no mapping and no recent candidate",
                tenant, raw
            );
        } else {
            warn!(
                "Tenant {}: opaque id {} is ambiguous ({} recent unmapped contacts), not guessing",
                tenant,
                raw,
                candidates.len()
            );
        }
        Ok(Resolution::Unresolved {
            placeholder: raw.clone(),
            candidates: candidates.len(),
        })
    }

    /// Record that we are about to send to `phone`, refreshing its activity so
    /// an immediate reply from a not-yet-known opaque id can bind to it.
    pub async fn touch_outbound(&self, tenant_id: &str, phone: &str) -> Result<()> {
        self.store
            .upsert_mapping(MappingUpsert::new(tenant_id, phone))
            .await?;
        Ok(())
    }

    /// Persist an opaque id the session's directory returned for `phone`.
    pub async fn learn(&self, tenant_id: &str, phone: &str, whatsapp_id: &str) -> Result<()> {
        let Some(id) = Jid::parse(whatsapp_id) else {
            return Ok(());
        };
        // The directory may answer with the phone JID itself; nothing to learn.
        if !id.is_lid() && id.user == phone {
            return Ok(());
        }
        self.store
            .upsert_mapping(MappingUpsert::new(tenant_id, phone).whatsapp_id(&id.user))
            .await?;
        log_component!(
            debug,
            "identity",
            "learned opaque id before send",
            tenant = tenant_id,
            phone = mask_phone(phone).as_str()
        );
        Ok(())
    }
}

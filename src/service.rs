//! Connector service - owns every per-tenant registry and wires the pipeline
//!
//! Inbound: session event → classifier → identity resolver → origin check →
//! message record → CRM sync.
//!
//! Outbound: API call → (optional) delivery queue → directory lookup → origin
//! mark → session send → message record.
//!
//! CRM failures never propagate out of the inbound path; they are logged and
//! the event is still considered handled.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::classify::{ClassifiedMessage, Classification, DropReason, MessageClassifier, RawEvent};
use crate::config::{Config, RateLimitConfig};
use crate::crm::{ContactLookup, CrmClient, CrmContact, CrmMessage};
use crate::error::{ConnectorError, Result};
use crate::identity::{
    is_canonical_phone, normalize_phone, IdentityResolver, Jid, Resolution, ResolveRequest,
};
use crate::lifecycle::{LifecycleManager, QrCode, TenantStatus};
use crate::log_component;
use crate::origin::OriginTracker;
use crate::queue::{DeliveryQueue, OutboundSender, QueueEntry, QueueStatus};
use crate::session::{OutboundPayload, SessionClient, SessionEvent, SessionEventKind};
use crate::store::{ConnectionStatus, ContentKind, Direction, MessageRecord, Store, SubAccount};
use crate::utils::string::{mask_phone, preview};
use crate::webhook::WebhookDispatcher;

/// A message to send, as the API receives it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub to: String,
    pub content: String,
    pub kind: ContentKind,
    pub media_url: Option<String>,
    pub filename: Option<String>,
}

impl OutboundMessage {
    pub fn text(to: &str, content: &str) -> Self {
        Self {
            to: to.to_string(),
            content: content.to_string(),
            kind: ContentKind::Text,
            media_url: None,
            filename: None,
        }
    }

    pub fn media(to: &str, kind: ContentKind, url: &str, caption: &str) -> Self {
        Self {
            to: to.to_string(),
            content: caption.to_string(),
            kind,
            media_url: Some(url.to_string()),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    fn into_entry(self, tenant_id: &str) -> QueueEntry {
        let entry = QueueEntry::new(tenant_id, &self.to, &self.content, self.kind);
        match &self.media_url {
            Some(url) => entry.with_media(url, self.filename.as_deref()),
            None => entry,
        }
    }
}

impl From<&QueueEntry> for OutboundMessage {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            to: entry.to.clone(),
            content: entry.content.clone(),
            kind: entry.kind,
            media_url: entry.media_url.clone(),
            filename: entry.filename.clone(),
        }
    }
}

/// What happened to one message event.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Dropped(DropReason),
    /// Echo of a message this connector sent
    Echo,
    Stored {
        resolution: Resolution,
        synced: bool,
    },
}

/// Sends one message and records it. Shared by direct sends and the queue.
struct Outbox {
    store: Arc<dyn Store>,
    session: Arc<dyn SessionClient>,
    resolver: Arc<IdentityResolver>,
    origin: Arc<OriginTracker>,
    lifecycle: Arc<LifecycleManager>,
}

impl Outbox {
    async fn send(&self, tenant_id: &str, msg: &OutboundMessage) -> Result<MessageRecord> {
        let phone = normalize_phone(&msg.to);
        if !is_canonical_phone(&phone) {
            return Err(ConnectorError::InvalidInput(format!(
                "invalid destination number: {}",
                msg.to
            )));
        }
        if !self.lifecycle.is_connected(tenant_id).await {
            return Err(ConnectorError::NotConnected(tenant_id.to_string()));
        }

        self.resolver.touch_outbound(tenant_id, &phone).await?;
        // A directory answer beats the recent-candidate heuristic for the reply.
        match self.session.lookup_identifier(tenant_id, &phone).await {
            Ok(Some(id)) => self.resolver.learn(tenant_id, &phone, &id).await?,
            Ok(None) => {}
            Err(e) => debug!("Tenant {}: identifier lookup failed: {}", tenant_id, e),
        }

        // Marked before sending: the echo can arrive before send() returns.
        self.origin.mark(tenant_id, &phone);

        let payload = OutboundPayload::from_parts(
            msg.kind,
            &msg.content,
            msg.media_url.as_deref(),
            msg.filename.as_deref(),
        );
        let message_id = self
            .session
            .send(tenant_id, &Jid::phone(&phone), &payload)
            .await?;

        // The recipient has the message now. Failing here would make the
        // queue send it a second time.
        let record = match self
            .record_sent(tenant_id, &message_id, &phone, msg, &payload)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "Tenant {}: message {} sent but not recorded: {}",
                    tenant_id, message_id, e
                );
                MessageRecord::new(
                    tenant_id,
                    &message_id,
                    Direction::Outbound,
                    payload.kind(),
                    &msg.content,
                )
                .with_numbers("", &phone)
            }
        };

        log_component!(
            info,
            "outbound",
            "message sent",
            tenant = tenant_id,
            to = mask_phone(&phone).as_str(),
            message_id = message_id.as_str()
        );
        Ok(record)
    }

    /// Persist the record of a message the session accepted.
    async fn record_sent(
        &self,
        tenant_id: &str,
        message_id: &str,
        phone: &str,
        msg: &OutboundMessage,
        payload: &OutboundPayload,
    ) -> Result<MessageRecord> {
        let own = self
            .store
            .get_sub_account(tenant_id)
            .await?
            .and_then(|s| s.phone_number)
            .unwrap_or_default();
        let mut record = MessageRecord::new(
            tenant_id,
            message_id,
            Direction::Outbound,
            payload.kind(),
            &msg.content,
        )
        .with_numbers(&own, phone)
        .with_metadata("raw", serde_json::to_value(payload)?);
        if let Some(url) = &msg.media_url {
            record = record.with_metadata("media_url", json!(url));
        }
        self.store.insert_message(record.clone()).await?;
        Ok(record)
    }
}

#[async_trait]
impl OutboundSender for Outbox {
    async fn deliver(&self, entry: &QueueEntry) -> Result<String> {
        let record = self
            .send(&entry.tenant_id, &OutboundMessage::from(entry))
            .await?;
        Ok(record.message_id)
    }
}

/// The supervising service. One instance per process.
pub struct ConnectorService {
    config: Config,
    store: Arc<dyn Store>,
    session: Arc<dyn SessionClient>,
    crm: Option<Arc<dyn CrmClient>>,
    webhooks: WebhookDispatcher,
    classifier: MessageClassifier,
    resolver: Arc<IdentityResolver>,
    origin: Arc<OriginTracker>,
    lifecycle: Arc<LifecycleManager>,
    outbox: Arc<Outbox>,
    queue: DeliveryQueue,
}

impl ConnectorService {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        session: Arc<dyn SessionClient>,
        crm: Option<Arc<dyn CrmClient>>,
    ) -> Result<Self> {
        let webhooks = WebhookDispatcher::new(config.webhook.clone())?;
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&store),
            Arc::clone(&session),
            webhooks.clone(),
            Duration::from_secs(config.lifecycle.reconnect_delay_secs),
        ));
        let resolver = Arc::new(IdentityResolver::new(
            Arc::clone(&store),
            config.identity.candidate_window_secs,
        ));
        let origin = Arc::new(OriginTracker::new(Duration::from_secs(
            config.origin.ttl_secs,
        )));
        let outbox = Arc::new(Outbox {
            store: Arc::clone(&store),
            session: Arc::clone(&session),
            resolver: Arc::clone(&resolver),
            origin: Arc::clone(&origin),
            lifecycle: Arc::clone(&lifecycle),
        });
        let queue = DeliveryQueue::new(outbox.clone(), &config.queue);

        Ok(Self {
            classifier: MessageClassifier::new(Arc::clone(&store)),
            config,
            store,
            session,
            crm,
            webhooks,
            resolver,
            origin,
            lifecycle,
            outbox,
            queue,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn sub_account(&self, tenant_id: &str) -> Result<SubAccount> {
        self.store
            .get_sub_account(tenant_id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound(format!("tenant {}", tenant_id)))
    }

    // ------------------------------------------------------------------
    // Session events
    // ------------------------------------------------------------------

    /// Dispatch one session event.
    pub async fn handle_event(&self, event: SessionEvent) -> Result<()> {
        let tenant = event.tenant_id.as_str();
        match event.kind {
            SessionEventKind::Qr(data) => self.lifecycle.on_qr(tenant, data).await,
            SessionEventKind::Open { phone } => self.lifecycle.on_open(tenant, &phone).await,
            SessionEventKind::Close(reason) => self.lifecycle.on_close(tenant, reason).await,
            SessionEventKind::Message(raw) => self.handle_message(tenant, raw).await.map(|_| ()),
            SessionEventKind::RetryRequest { message_id } => {
                self.answer_retry(tenant, &message_id).await
            }
        }
    }

    /// Run one message event through the inbound pipeline.
    pub async fn handle_message(&self, tenant_id: &str, raw: RawEvent) -> Result<MessageOutcome> {
        let msg = match self.classifier.classify(tenant_id, raw).await? {
            Classification::Drop(reason) => return Ok(MessageOutcome::Dropped(reason)),
            Classification::Inbound(m) | Classification::Outbound(m) => m,
        };

        let alt_phone = msg
            .event
            .remote_jid_alt
            .as_deref()
            .and_then(Jid::parse)
            .filter(|j| !j.is_lid())
            .map(|j| j.user);
        let mut req = ResolveRequest::new(tenant_id, &msg.contact);
        req.opaque_hint = msg.event.opaque_hint();
        req.alt_phone = alt_phone.as_deref();
        req.push_name = msg.event.push_name.as_deref();
        req.self_echo = msg.direction == Direction::Outbound;
        let resolution = self.resolver.resolve(&req).await?;

        if msg.direction == Direction::Outbound {
            if let Some(phone) = resolution.phone() {
                if self.origin.is_origin(tenant_id, phone) {
                    debug!("Tenant {}: echo of own send {} suppressed", tenant_id, msg.event.id);
                    return Ok(MessageOutcome::Echo);
                }
            }
        }

        let sub = self.store.get_sub_account(tenant_id).await?;
        let own = sub
            .as_ref()
            .and_then(|s| s.phone_number.clone())
            .unwrap_or_default();
        let number = resolution.display_number();
        let (from, to) = match msg.direction {
            Direction::Inbound => (number, own.as_str()),
            Direction::Outbound => (own.as_str(), number),
        };

        let body = msg.content.body();
        let mut record = MessageRecord::new(
            tenant_id,
            &msg.event.id,
            msg.direction,
            msg.content.kind(),
            &body,
        )
        .with_numbers(from, to)
        .with_metadata("raw", serde_json::to_value(&msg.event)?)
        .with_metadata("resolved", json!(resolution.is_resolved()));
        if let Some(url) = msg.content.media_url() {
            record = record.with_metadata("media_url", json!(url));
        }
        if let Some(name) = msg.event.push_name.as_deref().filter(|_| !req.self_echo) {
            record = record.with_metadata("push_name", json!(name));
        }

        if !self.store.insert_message(record.clone()).await? {
            return Ok(MessageOutcome::Dropped(DropReason::Duplicate));
        }

        let synced = match sub {
            Some(sub) => self.sync_to_crm(&sub, &msg, &resolution, &record).await,
            None => false,
        };
        Ok(MessageOutcome::Stored { resolution, synced })
    }

    /// Mirror a stored message into the tenant's CRM. Never fails.
    async fn sync_to_crm(
        &self,
        sub: &SubAccount,
        msg: &ClassifiedMessage,
        resolution: &Resolution,
        record: &MessageRecord,
    ) -> bool {
        let Some(crm) = &self.crm else {
            return false;
        };
        let Some(location) = sub.location_id.as_deref() else {
            debug!("Tenant {}: no CRM location bound, sync skipped", sub.id);
            return false;
        };

        match self
            .post_to_crm(crm.as_ref(), location, msg, resolution, record)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                info!(
                    "Tenant {}: sender {} unresolved, CRM sync skipped",
                    sub.id,
                    resolution.display_number()
                );
                false
            }
            Err(e) => {
                warn!("Tenant {}: CRM sync of {} failed: {}", sub.id, record.message_id, e);
                false
            }
        }
    }

    async fn post_to_crm(
        &self,
        crm: &dyn CrmClient,
        location: &str,
        msg: &ClassifiedMessage,
        resolution: &Resolution,
        record: &MessageRecord,
    ) -> Result<bool> {
        let contact: CrmContact = match resolution {
            Resolution::Resolved { phone, name, .. } => {
                crm.find_or_create_contact(location, &ContactLookup::new(phone, name.as_deref()))
                    .await?
            }
            Resolution::Unresolved { .. } => {
                // Our own push name on an outbound event says nothing about the contact.
                let name = match msg.direction {
                    Direction::Inbound => msg.event.push_name.as_deref(),
                    Direction::Outbound => None,
                };
                let Some(name) = name.filter(|n| !n.trim().is_empty()) else {
                    return Ok(false);
                };
                match crm.find_contact_by_name(location, name).await? {
                    Some(contact) => contact,
                    None => return Ok(false),
                }
            }
        };

        let conversation_id = crm
            .find_or_create_conversation(location, &contact.id)
            .await?;
        let timestamp = msg
            .event
            .timestamp
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .unwrap_or(record.created_at);
        let crm_message = CrmMessage {
            conversation_id,
            contact_id: contact.id,
            direction: record.direction,
            body: record.content.clone(),
            attachments: msg.content.media_url().map(str::to_string).into_iter().collect(),
            provider_message_id: record.message_id.clone(),
            timestamp,
        };
        let crm_id = crm.post_message(location, &crm_message).await?;
        log_component!(
            debug,
            "crm",
            "message synced",
            tenant = msg.tenant_id.as_str(),
            direction = record.direction.as_str(),
            crm_id = crm_id.as_str(),
            body = preview(&record.content, 40).as_str()
        );
        Ok(true)
    }

    async fn answer_retry(&self, tenant_id: &str, message_id: &str) -> Result<()> {
        match self.stored_payload(tenant_id, message_id).await? {
            Some(payload) => {
                debug!("Tenant {}: replaying {} on retry request", tenant_id, message_id);
                self.session.replay(tenant_id, message_id, &payload).await
            }
            None => {
                warn!(
                    "Tenant {}: retry request for unknown message {}",
                    tenant_id, message_id
                );
                Ok(())
            }
        }
    }

    /// Raw payload stored with a message, for decrypt-retry replay.
    pub async fn stored_payload(&self, tenant_id: &str, message_id: &str) -> Result<Option<Value>> {
        Ok(self
            .store
            .get_message(tenant_id, message_id)
            .await?
            .and_then(|m| m.raw_payload().cloned()))
    }

    /// Consume session events until the channel closes or shutdown fires.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Connector event loop started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let tenant = event.tenant_id.clone();
                    if let Err(e) = self.handle_event(event).await {
                        warn!("Tenant {}: event handling failed: {}", tenant, e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Connector event loop stopped");
    }

    /// Start the origin mark sweeper.
    pub fn spawn_origin_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.origin.spawn_sweeper(
            Duration::from_secs(self.config.origin.sweep_interval_secs.max(1)),
            shutdown,
        )
    }

    // ------------------------------------------------------------------
    // Connection API
    // ------------------------------------------------------------------

    pub async fn connect(&self, tenant_id: &str) -> Result<ConnectionStatus> {
        let sub = self.sub_account(tenant_id).await?;
        if let Some(rate_limit) = sub.rate_limit {
            self.queue.set_rate_limit(tenant_id, rate_limit);
        }
        self.lifecycle.connect(tenant_id).await
    }

    pub async fn disconnect(&self, tenant_id: &str, logout: bool) -> Result<()> {
        self.lifecycle.disconnect(tenant_id, logout).await
    }

    pub async fn get_status(&self, tenant_id: &str) -> Result<TenantStatus> {
        self.lifecycle.get_status(tenant_id).await
    }

    pub async fn get_qr_code(&self, tenant_id: &str) -> Result<Option<QrCode>> {
        self.sub_account(tenant_id).await?;
        Ok(self.lifecycle.get_qr(tenant_id).await)
    }

    /// Reconnect tenants persisted as connected and apply stored rate limits.
    pub async fn restore_sessions(&self) -> Result<usize> {
        for sub in self.store.list_sub_accounts().await? {
            if let Some(rate_limit) = sub.rate_limit {
                self.queue.set_rate_limit(&sub.id, rate_limit);
            }
        }
        self.lifecycle.restore_sessions().await
    }

    // ------------------------------------------------------------------
    // Messaging API
    // ------------------------------------------------------------------

    /// Send immediately, bypassing the queue. Errors go to the caller.
    pub async fn send_message(&self, tenant_id: &str, msg: OutboundMessage) -> Result<MessageRecord> {
        self.sub_account(tenant_id).await?;
        self.outbox.send(tenant_id, &msg).await
    }

    /// Accept a message for drip-mode delivery. Returns the queue entry id.
    pub async fn queue_message(&self, tenant_id: &str, msg: OutboundMessage) -> Result<String> {
        self.sub_account(tenant_id).await?;
        let phone = normalize_phone(&msg.to);
        if !is_canonical_phone(&phone) {
            return Err(ConnectorError::InvalidInput(format!(
                "invalid destination number: {}",
                msg.to
            )));
        }
        let msg = OutboundMessage { to: phone, ..msg };
        self.queue.enqueue(msg.into_entry(tenant_id))
    }

    /// Change a tenant's drip settings. Persisted and applied from the next dequeue.
    pub async fn set_rate_limit(&self, tenant_id: &str, rate_limit: RateLimitConfig) -> Result<()> {
        let mut sub = self.sub_account(tenant_id).await?;
        sub.rate_limit = Some(rate_limit);
        self.store.save_sub_account(&sub).await?;
        self.queue.set_rate_limit(tenant_id, rate_limit);
        Ok(())
    }

    pub fn get_queue_status(&self, tenant_id: &str) -> QueueStatus {
        self.queue.status(tenant_id)
    }

    pub fn pause_queue(&self, tenant_id: &str) {
        self.queue.pause(tenant_id);
    }

    pub fn resume_queue(&self, tenant_id: &str) {
        self.queue.resume(tenant_id);
    }

    pub fn clear_queue(&self, tenant_id: &str) -> usize {
        self.queue.clear(tenant_id)
    }

    /// Undecryptable events seen for a tenant since startup.
    pub fn decrypt_failures(&self, tenant_id: &str) -> u64 {
        self.classifier.decrypt_failures(tenant_id)
    }

    /// Tear down every per-tenant registry entry and delete the tenant.
    pub async fn remove_tenant(&self, tenant_id: &str) -> Result<bool> {
        self.lifecycle.remove_tenant(tenant_id).await;
        let dropped = self.queue.remove_tenant(tenant_id);
        self.origin.remove_tenant(tenant_id);
        self.classifier.remove_tenant(tenant_id);
        self.webhooks.remove_tenant(tenant_id);
        let existed = self.store.delete_sub_account(tenant_id).await?;
        log_component!(
            info,
            "service",
            "tenant removed",
            tenant = tenant_id,
            dropped_entries = dropped
        );
        Ok(existed)
    }
}

//! Lifecycle module - per-tenant connection state machine
//!
//! ```text
//!                connect             qr event            open event
//! disconnected ──────────▶ connecting ────────▶ qr_ready ──────────▶ connected
//!      ▲                                                                 │
//!      └──────────── explicit disconnect, logout, phone conflict ────────┘
//! ```
//!
//! A recoverable drop moves a tenant back to `connecting` and schedules a
//! reconnect, keeping credentials. A reconnect that fails for a transient
//! reason is retried with exponential backoff. A logout wipes credentials.
//!
//! A tenant that is coming back (restored at startup or reconnecting after a
//! drop) keeps a claim on its last phone number, so another tenant opening
//! with that number first is treated as the conflicting one.
//!
//! Every transition for a tenant runs under that tenant's async mutex, so
//! events and API calls for the same tenant never interleave. Explicit
//! `connect`/`disconnect` bump a generation counter; a scheduled reconnect
//! only fires if the generation it captured is still current.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result, SessionError};
use crate::identity::normalize_phone;
use crate::log_component;
use crate::session::SessionClient;
use crate::store::{ConnectionStatus, Store, SubAccount};
use crate::utils::string::mask_phone;
use crate::webhook::WebhookDispatcher;

/// Upper bound for the reconnect backoff.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);
/// Cap on the backoff exponent.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Pairing QR currently shown for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QrCode {
    pub data: String,
    pub generated_at: DateTime<Utc>,
}

/// Reported by [`LifecycleManager::get_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantStatus {
    pub tenant_id: String,
    pub status: ConnectionStatus,
    pub phone_number: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub qr_available: bool,
}

#[derive(Debug, Default)]
struct TenantSession {
    state: ConnectionStatus,
    qr: Option<QrCode>,
    /// A session object exists on the session side
    live: bool,
    generation: u64,
}

type SessionSlot = Arc<AsyncMutex<TenantSession>>;

pub struct LifecycleManager {
    store: Arc<dyn Store>,
    session: Arc<dyn SessionClient>,
    webhooks: WebhookDispatcher,
    reconnect_delay: Duration,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    /// tenant → phone it held before a restart or drop, until it opens again
    claims: Mutex<HashMap<String, String>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        session: Arc<dyn SessionClient>,
        webhooks: WebhookDispatcher,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            store,
            session,
            webhooks,
            reconnect_delay,
            sessions: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, tenant_id: &str) -> SessionSlot {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(sessions.entry(tenant_id.to_string()).or_default())
    }

    fn existing_slot(&self, tenant_id: &str) -> Option<SessionSlot> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(tenant_id).cloned()
    }

    fn claim_phone(&self, tenant_id: &str, phone: &str) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.insert(tenant_id.to_string(), phone.to_string());
    }

    fn release_claim(&self, tenant_id: &str) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.remove(tenant_id);
    }

    /// Another tenant that holds `phone`: connected now, or coming back with it.
    async fn phone_holder(&self, phone: &str, tenant_id: &str) -> Result<Option<String>> {
        if let Some(holder) = self.store.find_connected_by_phone(phone, tenant_id).await? {
            return Ok(Some(holder.id));
        }
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        Ok(claims
            .iter()
            .find(|(t, p)| t.as_str() != tenant_id && p.as_str() == phone)
            .map(|(t, _)| t.clone()))
    }

    async fn sub_account(&self, tenant_id: &str) -> Result<SubAccount> {
        self.store
            .get_sub_account(tenant_id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound(format!("tenant {}", tenant_id)))
    }

    async fn persist_status(
        &self,
        sub: &mut SubAccount,
        status: ConnectionStatus,
    ) -> Result<()> {
        if sub.status != status {
            log_component!(
                info,
                "lifecycle",
                "status changed",
                tenant = sub.id.as_str(),
                from = sub.status.as_str(),
                to = status.as_str()
            );
        }
        sub.status = status;
        self.store.save_sub_account(sub).await
    }

    fn notify(&self, sub: &SubAccount, event: &str, data: serde_json::Value) {
        self.webhooks
            .trigger(sub.webhook.as_ref(), &sub.id, event, data);
    }

    /// Start a session. Idempotent while a live session exists.
    pub async fn connect(&self, tenant_id: &str) -> Result<ConnectionStatus> {
        let slot = self.slot(tenant_id);
        let mut session = slot.lock().await;
        let mut sub = self.sub_account(tenant_id).await?;

        if session.live && session.state != ConnectionStatus::Disconnected {
            debug!("Tenant {} already {}, connect ignored", tenant_id, session.state);
            return Ok(session.state);
        }

        session.generation += 1;
        if let Err(e) = self.start_session(&mut session, &mut sub).await {
            self.fail_session(&mut session, &mut sub).await?;
            return Err(e);
        }
        Ok(session.state)
    }

    /// Ask the session to connect. Caller holds the tenant lock.
    async fn start_session(
        &self,
        session: &mut TenantSession,
        sub: &mut SubAccount,
    ) -> Result<()> {
        session.state = ConnectionStatus::Connecting;
        session.live = true;
        self.persist_status(sub, ConnectionStatus::Connecting).await?;

        if let Err(e) = self.session.connect(&sub.id).await {
            warn!("Tenant {}: session connect failed: {}", sub.id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Give up on a session that could not be started.
    async fn fail_session(&self, session: &mut TenantSession, sub: &mut SubAccount) -> Result<()> {
        session.state = ConnectionStatus::Disconnected;
        session.live = false;
        self.release_claim(&sub.id);
        self.persist_status(sub, ConnectionStatus::Disconnected).await
    }

    /// Close the session. With `logout`, credentials are wiped.
    pub async fn disconnect(&self, tenant_id: &str, logout: bool) -> Result<()> {
        let slot = self.slot(tenant_id);
        let mut session = slot.lock().await;
        let mut sub = self.sub_account(tenant_id).await?;

        session.generation += 1;
        if let Err(e) = self.session.disconnect(tenant_id, logout).await {
            // Local state is authoritative; the session may already be gone.
            warn!("Tenant {}: session disconnect failed: {}", tenant_id, e);
        }
        session.state = ConnectionStatus::Disconnected;
        session.qr = None;
        session.live = false;
        self.release_claim(tenant_id);
        if logout {
            sub.phone_number = None;
        }
        self.persist_status(&mut sub, ConnectionStatus::Disconnected)
            .await?;
        self.notify(&sub, "connection.closed", json!({ "logout": logout }));
        Ok(())
    }

    /// A new pairing QR arrived.
    pub async fn on_qr(&self, tenant_id: &str, data: String) -> Result<()> {
        let slot = self.slot(tenant_id);
        let mut session = slot.lock().await;
        let mut sub = self.sub_account(tenant_id).await?;

        if !session.live {
            debug!("Tenant {}: QR without a live session ignored", tenant_id);
            return Ok(());
        }
        session.state = ConnectionStatus::QrReady;
        session.qr = Some(QrCode {
            data: data.clone(),
            generated_at: Utc::now(),
        });
        self.persist_status(&mut sub, ConnectionStatus::QrReady)
            .await?;
        self.notify(&sub, "connection.qr", json!({ "qr": data }));
        Ok(())
    }

    /// The session authenticated as `phone`.
    ///
    /// If another tenant is already connected with the same number, or is
    /// coming back with it, this session is logged out and the tenant is left
    /// disconnected. An open that arrives after an explicit disconnect closes
    /// the stray session again and changes nothing.
    pub async fn on_open(&self, tenant_id: &str, phone: &str) -> Result<()> {
        let slot = self.slot(tenant_id);
        let mut session = slot.lock().await;
        let mut sub = self.sub_account(tenant_id).await?;
        let phone = normalize_phone(phone);

        if !session.live {
            debug!("Tenant {}: open without a live session, closing it", tenant_id);
            if let Err(e) = self.session.disconnect(tenant_id, false).await {
                warn!("Tenant {}: closing stray session failed: {}", tenant_id, e);
            }
            return Ok(());
        }

        if let Some(holder) = self.phone_holder(&phone, tenant_id).await? {
            warn!(
                "Tenant {}: phone {} already held by tenant {}, tearing down",
                tenant_id,
                mask_phone(&phone),
                holder
            );
            session.generation += 1;
            if let Err(e) = self.session.disconnect(tenant_id, true).await {
                warn!("Tenant {}: conflict logout failed: {}", tenant_id, e);
            }
            session.state = ConnectionStatus::Disconnected;
            session.qr = None;
            session.live = false;
            self.release_claim(tenant_id);
            sub.phone_number = None;
            self.persist_status(&mut sub, ConnectionStatus::Disconnected)
                .await?;

            let err = ConnectorError::PhoneAlreadyConnected {
                phone: phone.clone(),
                holder,
            };
            self.notify(
                &sub,
                "connection.error",
                json!({ "code": err.code(), "message": err.to_string(), "phone": phone }),
            );
            return Err(err);
        }

        session.state = ConnectionStatus::Connected;
        session.qr = None;
        session.live = true;
        self.release_claim(tenant_id);
        sub.phone_number = Some(phone.clone());
        sub.last_connected_at = Some(Utc::now());
        self.persist_status(&mut sub, ConnectionStatus::Connected)
            .await?;
        info!("Tenant {} connected as {}", tenant_id, mask_phone(&phone));
        self.notify(&sub, "connection.open", json!({ "phone": phone }));
        Ok(())
    }

    /// The session dropped.
    pub async fn on_close(self: &Arc<Self>, tenant_id: &str, reason: SessionError) -> Result<()> {
        let slot = self.slot(tenant_id);
        let mut session = slot.lock().await;
        let mut sub = self.sub_account(tenant_id).await?;

        if !session.live {
            debug!("Tenant {}: close after disconnect ignored ({})", tenant_id, reason);
            return Ok(());
        }

        if reason.is_recoverable() {
            warn!(
                "Tenant {}: session dropped ({}), reconnecting in {:?}",
                tenant_id, reason, self.reconnect_delay
            );
            session.state = ConnectionStatus::Connecting;
            if let Some(phone) = &sub.phone_number {
                self.claim_phone(tenant_id, phone);
            }
            self.persist_status(&mut sub, ConnectionStatus::Connecting)
                .await?;
            self.schedule_reconnect(tenant_id, session.generation, 0);
            return Ok(());
        }

        warn!("Tenant {}: logged out ({}), credentials wiped", tenant_id, reason);
        session.generation += 1;
        if let Err(e) = self.session.disconnect(tenant_id, true).await {
            debug!("Tenant {}: logout cleanup failed: {}", tenant_id, e);
        }
        session.state = ConnectionStatus::Disconnected;
        session.qr = None;
        session.live = false;
        self.release_claim(tenant_id);
        sub.phone_number = None;
        self.persist_status(&mut sub, ConnectionStatus::Disconnected)
            .await?;
        let err = ConnectorError::Session(reason);
        self.notify(
            &sub,
            "connection.logged_out",
            json!({ "code": err.code(), "message": err.to_string() }),
        );
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(MAX_RECONNECT_ATTEMPTS));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(MAX_RECONNECT_DELAY.max(self.reconnect_delay))
    }

    fn schedule_reconnect(self: &Arc<Self>, tenant_id: &str, generation: u64, attempt: u32) {
        let this = Arc::clone(self);
        let tenant_id = tenant_id.to_string();
        let delay = self.reconnect_backoff(attempt);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.reconnect_if_current(&tenant_id, generation, attempt).await {
                warn!("Tenant {}: reconnect failed: {}", tenant_id, e);
            }
        });
    }

    async fn reconnect_if_current(
        self: &Arc<Self>,
        tenant_id: &str,
        generation: u64,
        attempt: u32,
    ) -> Result<()> {
        let Some(slot) = self.existing_slot(tenant_id) else {
            return Ok(());
        };
        let mut session = slot.lock().await;
        if session.generation != generation || !session.live {
            debug!("Tenant {}: stale reconnect skipped", tenant_id);
            return Ok(());
        }
        let mut sub = self.sub_account(tenant_id).await?;
        log_component!(
            info,
            "lifecycle",
            "reconnecting",
            tenant = tenant_id,
            attempt = attempt + 1
        );
        match self.start_session(&mut session, &mut sub).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                let next = attempt.saturating_add(1);
                warn!(
                    "Tenant {}: reconnect attempt {} failed ({}), retrying in {:?}",
                    tenant_id,
                    attempt + 1,
                    e,
                    self.reconnect_backoff(next)
                );
                self.schedule_reconnect(tenant_id, generation, next);
                Ok(())
            }
            Err(e) => {
                self.fail_session(&mut session, &mut sub).await?;
                Err(e)
            }
        }
    }

    /// Current status. A `connecting`/`qr_ready` tenant without a live
    /// session (e.g. after a restart) is reset to `disconnected`.
    pub async fn get_status(&self, tenant_id: &str) -> Result<TenantStatus> {
        let slot = self.slot(tenant_id);
        let mut session = slot.lock().await;
        let mut sub = self.sub_account(tenant_id).await?;

        let mut status = if session.live {
            session.state
        } else {
            sub.status
        };
        if status.needs_live_session() && !session.live {
            info!(
                "Tenant {}: stale {} status without a live session, resetting",
                tenant_id, status
            );
            session.state = ConnectionStatus::Disconnected;
            session.qr = None;
            self.persist_status(&mut sub, ConnectionStatus::Disconnected)
                .await?;
            status = ConnectionStatus::Disconnected;
        }

        Ok(TenantStatus {
            tenant_id: tenant_id.to_string(),
            status,
            phone_number: sub.phone_number,
            last_connected_at: sub.last_connected_at,
            qr_available: status == ConnectionStatus::QrReady && session.qr.is_some(),
        })
    }

    /// QR to display, if the tenant is waiting for a scan.
    pub async fn get_qr(&self, tenant_id: &str) -> Option<QrCode> {
        let slot = self.existing_slot(tenant_id)?;
        let session = slot.lock().await;
        if session.state == ConnectionStatus::QrReady {
            session.qr.clone()
        } else {
            None
        }
    }

    /// True if the tenant has an authenticated live session.
    pub async fn is_connected(&self, tenant_id: &str) -> bool {
        match self.existing_slot(tenant_id) {
            Some(slot) => {
                let session = slot.lock().await;
                session.live && session.state == ConnectionStatus::Connected
            }
            None => false,
        }
    }

    /// Reconnect every tenant persisted as `connected`. Returns how many
    /// sessions were started.
    ///
    /// Each restored tenant keeps a claim on its persisted phone number
    /// until its session opens, fails or is disconnected.
    pub async fn restore_sessions(&self) -> Result<usize> {
        let subs: Vec<SubAccount> = self
            .store
            .list_sub_accounts()
            .await?
            .into_iter()
            .filter(|s| s.status == ConnectionStatus::Connected)
            .collect();
        // Claimed up front so the first open cannot take a number that a
        // later tenant in the list held before the restart.
        for sub in &subs {
            if let Some(phone) = &sub.phone_number {
                self.claim_phone(&sub.id, phone);
            }
        }

        let mut restored = 0;
        for sub in subs {
            match self.connect(&sub.id).await {
                Ok(_) => restored += 1,
                Err(e) => warn!("Tenant {}: restore failed: {}", sub.id, e),
            }
        }
        if restored > 0 {
            info!("Restored {} sessions", restored);
        }
        Ok(restored)
    }

    /// Tear a tenant's session down and forget it.
    pub async fn remove_tenant(&self, tenant_id: &str) {
        self.release_claim(tenant_id);
        let Some(slot) = self.existing_slot(tenant_id) else {
            return;
        };
        {
            let mut session = slot.lock().await;
            session.generation += 1;
            if session.live {
                if let Err(e) = self.session.disconnect(tenant_id, true).await {
                    debug!("Tenant {}: logout on removal failed: {}", tenant_id, e);
                }
            }
            session.live = false;
            session.state = ConnectionStatus::Disconnected;
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(tenant_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::identity::Jid;
    use crate::session::OutboundPayload;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeSession {
        calls: Mutex<Vec<String>>,
        fail_connect: AtomicBool,
    }

    impl FakeSession {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn connect_count(&self) -> usize {
            self.calls().iter().filter(|c| c.starts_with("connect")).count()
        }
    }

    #[async_trait]
    impl SessionClient for FakeSession {
        async fn connect(&self, tenant_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("connect:{}", tenant_id));
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(SessionError::Network("bridge down".into()).into());
            }
            Ok(())
        }
        async fn disconnect(&self, tenant_id: &str, logout: bool) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("disconnect:{}:{}", tenant_id, logout));
            Ok(())
        }
        async fn send(&self, _: &str, _: &Jid, _: &OutboundPayload) -> Result<String> {
            Ok("wamid.x".into())
        }
        async fn lookup_identifier(&self, _: &str, _: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn replay(&self, _: &str, _: &str, _: &serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    async fn setup(
        tenants: &[&str],
    ) -> (Arc<LifecycleManager>, Arc<FakeSession>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for t in tenants {
            store.save_sub_account(&SubAccount::new(t)).await.unwrap();
        }
        let session = Arc::new(FakeSession::default());
        let webhooks = WebhookDispatcher::new(WebhookConfig::default()).unwrap();
        let manager = Arc::new(LifecycleManager::new(
            store.clone(),
            session.clone(),
            webhooks,
            Duration::from_millis(30),
        ));
        (manager, session, store)
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let (m, _s, store) = setup(&["t1"]).await;
        assert_eq!(m.connect("t1").await.unwrap(), ConnectionStatus::Connecting);

        m.on_qr("t1", "2@qr-1".into()).await.unwrap();
        assert_eq!(m.get_status("t1").await.unwrap().status, ConnectionStatus::QrReady);
        assert_eq!(m.get_qr("t1").await.unwrap().data, "2@qr-1");

        // QR regenerates in place
        m.on_qr("t1", "2@qr-2".into()).await.unwrap();
        assert_eq!(m.get_qr("t1").await.unwrap().data, "2@qr-2");

        m.on_open("t1", "393806510543").await.unwrap();
        let status = m.get_status("t1").await.unwrap();
        assert_eq!(status.status, ConnectionStatus::Connected);
        assert_eq!(status.phone_number.as_deref(), Some("393806510543"));
        assert!(status.last_connected_at.is_some());
        assert!(m.get_qr("t1").await.is_none());
        assert!(m.is_connected("t1").await);

        let sub = store.get_sub_account("t1").await.unwrap().unwrap();
        assert_eq!(sub.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_connect_unknown_tenant() {
        let (m, _s, _) = setup(&[]).await;
        assert!(matches!(
            m.connect("ghost").await,
            Err(ConnectorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_live() {
        let (m, s, _) = setup(&["t1"]).await;
        m.connect("t1").await.unwrap();
        m.connect("t1").await.unwrap();
        assert_eq!(s.calls(), vec!["connect:t1"]);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let (m, s, _) = setup(&["t1"]).await;
        s.fail_connect.store(true, Ordering::SeqCst);
        assert!(m.connect("t1").await.is_err());
        assert_eq!(
            m.get_status("t1").await.unwrap().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_phone_conflict_tears_down_newer_session() {
        let (m, s, store) = setup(&["t1", "t2"]).await;
        m.connect("t1").await.unwrap();
        m.on_open("t1", "393806510543").await.unwrap();

        m.connect("t2").await.unwrap();
        let err = m.on_open("t2", "+39 380 651 0543").await.unwrap_err();
        assert_eq!(err.code(), "phone_already_connected");

        assert!(s.calls().contains(&"disconnect:t2:true".to_string()));
        let t2 = store.get_sub_account("t2").await.unwrap().unwrap();
        assert_eq!(t2.status, ConnectionStatus::Disconnected);
        assert!(t2.phone_number.is_none());
        // The first holder is untouched
        assert!(m.is_connected("t1").await);
    }

    #[tokio::test]
    async fn test_recoverable_close_reconnects() {
        let (m, s, _) = setup(&["t1"]).await;
        m.connect("t1").await.unwrap();
        m.on_open("t1", "393806510543").await.unwrap();

        m.on_close("t1", SessionError::Network("reset".into()))
            .await
            .unwrap();
        assert_eq!(
            m.get_status("t1").await.unwrap().status,
            ConnectionStatus::Connecting
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.calls(), vec!["connect:t1", "connect:t1"]);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_wins_over_pending_reconnect() {
        let (m, s, _) = setup(&["t1"]).await;
        m.connect("t1").await.unwrap();
        m.on_open("t1", "393806510543").await.unwrap();
        m.on_close("t1", SessionError::Timeout("ping".into()))
            .await
            .unwrap();
        m.disconnect("t1", false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.calls(), vec!["connect:t1", "disconnect:t1:false"]);
        assert_eq!(
            m.get_status("t1").await.unwrap().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_logout_wipes_and_does_not_reconnect() {
        let (m, s, store) = setup(&["t1"]).await;
        m.connect("t1").await.unwrap();
        m.on_open("t1", "393806510543").await.unwrap();
        m.on_close("t1", SessionError::LoggedOut("401".into()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.calls(), vec!["connect:t1", "disconnect:t1:true"]);
        let sub = store.get_sub_account("t1").await.unwrap().unwrap();
        assert_eq!(sub.status, ConnectionStatus::Disconnected);
        assert!(sub.phone_number.is_none());
    }

    #[tokio::test]
    async fn test_stale_status_reset_after_restart() {
        let (m, _s, store) = setup(&[]).await;
        let mut sub = SubAccount::new("t1");
        sub.status = ConnectionStatus::QrReady;
        store.save_sub_account(&sub).await.unwrap();

        let status = m.get_status("t1").await.unwrap();
        assert_eq!(status.status, ConnectionStatus::Disconnected);
        assert_eq!(
            store.get_sub_account("t1").await.unwrap().unwrap().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_restore_sessions_reconnects_connected_only() {
        let (m, s, store) = setup(&[]).await;
        for (id, status) in [
            ("a", ConnectionStatus::Connected),
            ("b", ConnectionStatus::Disconnected),
            ("c", ConnectionStatus::Connected),
        ] {
            let mut sub = SubAccount::new(id);
            sub.status = status;
            store.save_sub_account(&sub).await.unwrap();
        }

        assert_eq!(m.restore_sessions().await.unwrap(), 2);
        assert_eq!(s.calls(), vec!["connect:a", "connect:c"]);
    }

    #[tokio::test]
    async fn test_open_after_disconnect_is_ignored() {
        let (m, s, store) = setup(&["t1"]).await;
        m.connect("t1").await.unwrap();
        m.disconnect("t1", false).await.unwrap();

        m.on_open("t1", "393806510543").await.unwrap();
        assert!(!m.is_connected("t1").await);
        assert_eq!(
            m.get_status("t1").await.unwrap().status,
            ConnectionStatus::Disconnected
        );
        // The stray session is closed again
        assert_eq!(
            s.calls(),
            vec!["connect:t1", "disconnect:t1:false", "disconnect:t1:false"]
        );
        let sub = store.get_sub_account("t1").await.unwrap().unwrap();
        assert!(sub.phone_number.is_none());
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_retried() {
        let (m, s, _) = setup(&["t1"]).await;
        m.connect("t1").await.unwrap();
        m.on_open("t1", "393806510543").await.unwrap();

        s.fail_connect.store(true, Ordering::SeqCst);
        m.on_close("t1", SessionError::Network("reset".into()))
            .await
            .unwrap();
        for _ in 0..100 {
            if s.connect_count() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.connect_count(), 2);
        assert_eq!(
            m.get_status("t1").await.unwrap().status,
            ConnectionStatus::Connecting
        );

        s.fail_connect.store(false, Ordering::SeqCst);
        for _ in 0..100 {
            if s.connect_count() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.connect_count(), 3);

        m.on_open("t1", "393806510543").await.unwrap();
        assert!(m.is_connected("t1").await);
    }

    #[tokio::test]
    async fn test_reconnect_backoff_doubles_and_caps() {
        let (m, _s, _) = setup(&[]).await;
        assert_eq!(m.reconnect_backoff(0), Duration::from_millis(30));
        assert_eq!(m.reconnect_backoff(1), Duration::from_millis(60));
        assert_eq!(m.reconnect_backoff(u32::MAX), Duration::from_millis(30 * 1024));

        let slow = LifecycleManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeSession::default()),
            WebhookDispatcher::new(WebhookConfig::default()).unwrap(),
            Duration::from_secs(5),
        );
        assert_eq!(slow.reconnect_backoff(9), MAX_RECONNECT_DELAY);
    }

    #[tokio::test]
    async fn test_restored_tenant_keeps_its_phone() {
        let (m, _s, store) = setup(&["b"]).await;
        let mut a = SubAccount::new("a");
        a.status = ConnectionStatus::Connected;
        a.phone_number = Some("393806510543".into());
        store.save_sub_account(&a).await.unwrap();

        assert_eq!(m.restore_sessions().await.unwrap(), 1);

        // b opens first with a's number while a is still coming back
        m.connect("b").await.unwrap();
        let err = m.on_open("b", "393806510543").await.unwrap_err();
        assert_eq!(err.code(), "phone_already_connected");

        m.on_open("a", "393806510543").await.unwrap();
        assert!(m.is_connected("a").await);
        assert!(!m.is_connected("b").await);

        // Once a lets go, the number is free
        m.disconnect("a", false).await.unwrap();
        m.connect("b").await.unwrap();
        m.on_open("b", "393806510543").await.unwrap();
        assert!(m.is_connected("b").await);
    }

    #[tokio::test]
    async fn test_remove_tenant_logs_out_live_session() {
        let (m, s, _) = setup(&["t1"]).await;
        m.connect("t1").await.unwrap();
        m.remove_tenant("t1").await;
        assert!(s.calls().contains(&"disconnect:t1:true".to_string()));
        assert!(!m.is_connected("t1").await);
    }
}

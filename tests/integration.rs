//! Integration tests for wa-crm-bridge
//!
//! These drive the full connector service with an in-process session fake
//! and a mocked CRM: identity resolution, dedup, origin suppression, the
//! delivery queue and the connection lifecycle working together.

use async_trait::async_trait;
use mockall::mock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::sync::{mpsc, watch};

use wa_crm_bridge::classify::{DropReason, RawEvent};
use wa_crm_bridge::config::{Config, RateLimitConfig};
use wa_crm_bridge::crm::{ContactLookup, CrmClient, CrmContact, CrmMessage};
use wa_crm_bridge::error::{ConnectorError, Result, SessionError};
use wa_crm_bridge::identity::{Jid, Resolution, ResolutionSource};
use wa_crm_bridge::session::{OutboundPayload, SessionClient, SessionEvent, SessionEventKind};
use wa_crm_bridge::store::{ConnectionStatus, Direction, MemoryStore, Store, SubAccount};
use wa_crm_bridge::{ConnectorService, MessageOutcome, OutboundMessage};

// ============================================================================
// Fakes
// ============================================================================

/// Session client that records everything and never touches a network.
#[derive(Default)]
struct FakeSession {
    sends: Mutex<Vec<(String, String, Instant)>>,
    connects: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<(String, bool)>>,
    directory: Mutex<HashMap<String, String>>,
    fail_sends: AtomicBool,
}

impl FakeSession {
    fn sent_texts(&self) -> Vec<String> {
        self.sends.lock().unwrap().iter().map(|s| s.1.clone()).collect()
    }

    fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionClient for FakeSession {
    async fn connect(&self, tenant_id: &str) -> Result<()> {
        self.connects.lock().unwrap().push(tenant_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, tenant_id: &str, logout: bool) -> Result<()> {
        self.disconnects
            .lock()
            .unwrap()
            .push((tenant_id.to_string(), logout));
        Ok(())
    }

    async fn send(&self, _tenant_id: &str, to: &Jid, payload: &OutboundPayload) -> Result<String> {
        let text = match payload {
            OutboundPayload::Text { text } => text.clone(),
            OutboundPayload::Media { url, .. } => url.clone(),
        };
        let mut sends = self.sends.lock().unwrap();
        sends.push((to.user.clone(), text, Instant::now()));
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SessionError::Network("socket closed".into()).into());
        }
        Ok(format!("3EB0{:04}", sends.len()))
    }

    async fn lookup_identifier(&self, _tenant_id: &str, phone: &str) -> Result<Option<String>> {
        Ok(self.directory.lock().unwrap().get(phone).cloned())
    }

    async fn replay(&self, _tenant_id: &str, _message_id: &str, _payload: &Value) -> Result<()> {
        Ok(())
    }
}

mock! {
    pub Crm {}

    #[async_trait]
    impl CrmClient for Crm {
        async fn find_or_create_contact(
            &self,
            location_id: &str,
            contact: &ContactLookup,
        ) -> Result<CrmContact>;
        async fn find_or_create_conversation(&self, location_id: &str, contact_id: &str)
            -> Result<String>;
        async fn post_message(&self, location_id: &str, message: &CrmMessage) -> Result<String>;
        async fn find_contact_by_name(
            &self,
            location_id: &str,
            name: &str,
        ) -> Result<Option<CrmContact>>;
    }
}

// ============================================================================
// Helpers
// ============================================================================

const OWN_PHONE: &str = "391111111111";
const CONTACT_PHONE: &str = "393806510543";
const CONTACT_LID: &str = "250830569660605";

fn test_config() -> Config {
    let mut config = Config::default();
    config.queue.default_rate_limit = RateLimitConfig {
        enabled: false,
        delay_between_messages_ms: 0,
        jitter_ms: 0,
    };
    config.webhook.enabled = false;
    config.lifecycle.reconnect_delay_secs = 0;
    config
}

struct Harness {
    service: Arc<ConnectorService>,
    session: Arc<FakeSession>,
    store: Arc<MemoryStore>,
}

async fn harness_with(config: Config, crm: Option<MockCrm>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store
        .save_sub_account(&SubAccount::new("t1").with_location("loc-1"))
        .await
        .unwrap();
    let session = Arc::new(FakeSession::default());
    let crm = crm.map(|c| Arc::new(c) as Arc<dyn CrmClient>);
    let service =
        Arc::new(ConnectorService::new(config, store.clone(), session.clone(), crm).unwrap());
    Harness {
        service,
        session,
        store,
    }
}

/// Harness with tenant `t1` connected as [`OWN_PHONE`].
async fn connected(crm: Option<MockCrm>) -> Harness {
    let h = harness_with(test_config(), crm).await;
    h.service.connect("t1").await.unwrap();
    h.service
        .handle_event(open_event("t1", OWN_PHONE))
        .await
        .unwrap();
    h
}

fn open_event(tenant: &str, phone: &str) -> SessionEvent {
    SessionEvent::new(
        tenant,
        SessionEventKind::Open {
            phone: phone.to_string(),
        },
    )
}

fn text_event(id: &str, jid: &str, from_me: bool, text: &str) -> RawEvent {
    serde_json::from_value(json!({
        "id": id,
        "remoteJid": jid,
        "fromMe": from_me,
        "pushName": "Mario Rossi",
        "timestamp": 1_700_000_000,
        "message": { "conversation": text }
    }))
    .unwrap()
}

fn lid_jid() -> String {
    format!("{}@lid", CONTACT_LID)
}

fn phone_jid(phone: &str) -> String {
    format!("{}@s.whatsapp.net", phone)
}

async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn contact_for(lookup: &ContactLookup) -> CrmContact {
    CrmContact {
        id: "contact-1".into(),
        phone: Some(lookup.phone.clone()),
        name: lookup.name.clone(),
    }
}

// ============================================================================
// Identity resolution
// ============================================================================

#[tokio::test]
async fn test_lid_reply_binds_to_recent_outbound_contact() {
    let mut crm = MockCrm::new();
    crm.expect_find_or_create_contact()
        .withf(|loc, c| loc == "loc-1" && c.phone == CONTACT_PHONE)
        .times(2)
        .returning(|_, c| Ok(contact_for(c)));
    crm.expect_find_or_create_conversation()
        .withf(|_, contact| contact == "contact-1")
        .times(2)
        .returning(|_, _| Ok("conv-1".to_string()));
    crm.expect_post_message()
        .withf(|_, m| m.direction == Direction::Inbound && m.conversation_id == "conv-1")
        .times(2)
        .returning(|_, _| Ok("crm-msg".to_string()));

    let h = connected(Some(crm)).await;
    h.service
        .send_message("t1", OutboundMessage::text(CONTACT_PHONE, "Buongiorno"))
        .await
        .unwrap();

    // First reply arrives from an opaque id nobody has seen before.
    let outcome = h
        .service
        .handle_message("t1", text_event("IN-1", &lid_jid(), false, "Grazie"))
        .await
        .unwrap();
    match outcome {
        MessageOutcome::Stored {
            resolution: Resolution::Resolved { phone, source, .. },
            synced,
        } => {
            assert_eq!(phone, CONTACT_PHONE);
            assert_eq!(source, ResolutionSource::RecentCandidate);
            assert!(synced);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let mapping = h
        .store
        .find_mapping_by_whatsapp_id("t1", CONTACT_LID)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.phone_number, CONTACT_PHONE);
    assert_eq!(mapping.contact_name.as_deref(), Some("Mario Rossi"));

    // The second one goes through the stored mapping.
    let outcome = h
        .service
        .handle_message("t1", text_event("IN-2", &lid_jid(), false, "A domani"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        MessageOutcome::Stored {
            resolution: Resolution::Resolved {
                source: ResolutionSource::Mapping,
                ..
            },
            synced: true
        }
    ));

    let record = h.store.get_message("t1", "IN-1").await.unwrap().unwrap();
    assert_eq!(record.from_number, CONTACT_PHONE);
    assert_eq!(record.to_number, OWN_PHONE);
}

#[tokio::test]
async fn test_ambiguous_lid_is_stored_but_not_synced() {
    let mut crm = MockCrm::new();
    crm.expect_find_contact_by_name()
        .withf(|_, name| name == "Mario Rossi")
        .times(1)
        .returning(|_, _| Ok(None));

    let h = connected(Some(crm)).await;
    for phone in [CONTACT_PHONE, "393806510544"] {
        h.service
            .send_message("t1", OutboundMessage::text(phone, "Offerta"))
            .await
            .unwrap();
    }

    let outcome = h
        .service
        .handle_message("t1", text_event("IN-1", &lid_jid(), false, "Chi sei?"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        MessageOutcome::Stored {
            resolution: Resolution::Unresolved {
                placeholder: CONTACT_LID.to_string(),
                candidates: 2,
            },
            synced: false,
        }
    );

    // Neither row got the opaque id.
    assert!(h
        .store
        .find_mapping_by_whatsapp_id("t1", CONTACT_LID)
        .await
        .unwrap()
        .is_none());
    let record = h.store.get_message("t1", "IN-1").await.unwrap().unwrap();
    assert_eq!(record.from_number, CONTACT_LID);
    assert_eq!(record.metadata["resolved"], json!(false));
}

#[tokio::test]
async fn test_unresolved_sender_synced_through_name_fallback() {
    let mut crm = MockCrm::new();
    crm.expect_find_contact_by_name()
        .times(1)
        .returning(|_, _| {
            Ok(Some(CrmContact {
                id: "contact-9".into(),
                phone: Some(CONTACT_PHONE.into()),
                name: Some("Mario Rossi".into()),
            }))
        });
    crm.expect_find_or_create_conversation()
        .withf(|_, contact| contact == "contact-9")
        .returning(|_, _| Ok("conv-9".to_string()));
    crm.expect_post_message()
        .times(1)
        .returning(|_, _| Ok("crm-msg".to_string()));

    let h = connected(Some(crm)).await;
    let outcome = h
        .service
        .handle_message("t1", text_event("IN-1", &lid_jid(), false, "Ciao"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        MessageOutcome::Stored {
            resolution: Resolution::Unresolved { candidates: 0, .. },
            synced: true
        }
    ));
}

#[tokio::test]
async fn test_directory_lookup_beats_candidate_heuristic() {
    let h = connected(None).await;
    h.session
        .directory
        .lock()
        .unwrap()
        .insert(CONTACT_PHONE.to_string(), lid_jid());

    // Two recent contacts would make the heuristic give up.
    for phone in ["393806510544", CONTACT_PHONE] {
        h.service
            .send_message("t1", OutboundMessage::text(phone, "Offerta"))
            .await
            .unwrap();
    }

    let outcome = h
        .service
        .handle_message("t1", text_event("IN-1", &lid_jid(), false, "Interessato"))
        .await
        .unwrap();
    match outcome {
        MessageOutcome::Stored { resolution, .. } => {
            assert_eq!(resolution.phone(), Some(CONTACT_PHONE));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_resolution_is_per_tenant() {
    let h = connected(None).await;
    h.store.save_sub_account(&SubAccount::new("t2")).await.unwrap();
    h.service
        .send_message("t1", OutboundMessage::text(CONTACT_PHONE, "Ciao"))
        .await
        .unwrap();

    let outcome = h
        .service
        .handle_message("t2", text_event("IN-1", &lid_jid(), false, "Ciao"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        MessageOutcome::Stored {
            resolution: Resolution::Unresolved { candidates: 0, .. },
            ..
        }
    ));
}

// ============================================================================
// Classification and dedup
// ============================================================================

#[tokio::test]
async fn test_replayed_event_syncs_once() {
    let mut crm = MockCrm::new();
    crm.expect_find_or_create_contact()
        .times(1)
        .returning(|_, c| Ok(contact_for(c)));
    crm.expect_find_or_create_conversation()
        .times(1)
        .returning(|_, _| Ok("conv-1".to_string()));
    crm.expect_post_message()
        .times(1)
        .returning(|_, _| Ok("crm-msg".to_string()));

    let h = connected(Some(crm)).await;
    let event = text_event("IN-1", &phone_jid(CONTACT_PHONE), false, "Ciao");
    for _ in 0..3 {
        h.service.handle_message("t1", event.clone()).await.unwrap();
    }
    let again = h.service.handle_message("t1", event).await.unwrap();
    assert_eq!(again, MessageOutcome::Dropped(DropReason::Duplicate));
}

#[tokio::test]
async fn test_undecryptable_then_retry_is_not_a_duplicate() {
    let h = connected(None).await;
    let mut broken = text_event("IN-1", &phone_jid(CONTACT_PHONE), false, "");
    broken.message = None;

    assert_eq!(
        h.service.handle_message("t1", broken).await.unwrap(),
        MessageOutcome::Dropped(DropReason::DecryptFailed)
    );
    assert_eq!(h.service.decrypt_failures("t1"), 1);
    assert!(!h.store.has_message("t1", "IN-1").await.unwrap());

    let retried = text_event("IN-1", &phone_jid(CONTACT_PHONE), false, "Ciao");
    assert!(matches!(
        h.service.handle_message("t1", retried).await.unwrap(),
        MessageOutcome::Stored { .. }
    ));
}

#[tokio::test]
async fn test_noise_is_dropped() {
    let h = connected(None).await;
    let cases = [
        ("status@broadcast", DropReason::Broadcast),
        ("120363025246125888@g.us", DropReason::Group),
        ("120363144038483540@newsletter", DropReason::Newsletter),
    ];
    for (i, (jid, reason)) in cases.into_iter().enumerate() {
        let event = text_event(&format!("N-{}", i), jid, false, "spam");
        assert_eq!(
            h.service.handle_message("t1", event).await.unwrap(),
            MessageOutcome::Dropped(reason)
        );
    }

    let reaction: RawEvent = serde_json::from_value(json!({
        "id": "R-1",
        "remoteJid": phone_jid(CONTACT_PHONE),
        "message": { "reactionMessage": { "text": "👍" } }
    }))
    .unwrap();
    assert_eq!(
        h.service.handle_message("t1", reaction).await.unwrap(),
        MessageOutcome::Dropped(DropReason::Reaction)
    );
}

// ============================================================================
// Origin tracking
// ============================================================================

#[tokio::test]
async fn test_own_echo_suppressed_until_mark_expires() {
    let mut config = test_config();
    config.origin.ttl_secs = 1;
    let h = harness_with(config, None).await;
    h.service.connect("t1").await.unwrap();
    h.service
        .handle_event(open_event("t1", OWN_PHONE))
        .await
        .unwrap();

    h.service
        .send_message("t1", OutboundMessage::text(CONTACT_PHONE, "Ciao"))
        .await
        .unwrap();
    let echo = text_event("ECHO-1", &phone_jid(CONTACT_PHONE), true, "Ciao");
    assert_eq!(
        h.service.handle_message("t1", echo).await.unwrap(),
        MessageOutcome::Echo
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;

    // Past the TTL the same shape counts as typed on the operator's phone.
    let typed = text_event("DEV-1", &phone_jid(CONTACT_PHONE), true, "Ci sei?");
    assert!(matches!(
        h.service.handle_message("t1", typed).await.unwrap(),
        MessageOutcome::Stored { .. }
    ));
    let record = h.store.get_message("t1", "DEV-1").await.unwrap().unwrap();
    assert_eq!(record.direction, Direction::Outbound);
}

#[tokio::test]
async fn test_other_device_outbound_synced_as_outbound() {
    let mut crm = MockCrm::new();
    crm.expect_find_or_create_contact()
        .withf(|_, c| c.phone == CONTACT_PHONE && c.name.is_none())
        .returning(|_, c| Ok(contact_for(c)));
    crm.expect_find_or_create_conversation()
        .returning(|_, _| Ok("conv-1".to_string()));
    crm.expect_post_message()
        .withf(|_, m| m.direction == Direction::Outbound && m.body == "Ti chiamo dopo")
        .times(1)
        .returning(|_, _| Ok("crm-msg".to_string()));

    let h = connected(Some(crm)).await;
    let typed = text_event("DEV-1", &phone_jid(CONTACT_PHONE), true, "Ti chiamo dopo");
    assert!(matches!(
        h.service.handle_message("t1", typed).await.unwrap(),
        MessageOutcome::Stored { synced: true, .. }
    ));
}

#[tokio::test]
async fn test_crm_failure_is_swallowed() {
    let mut crm = MockCrm::new();
    crm.expect_find_or_create_contact()
        .returning(|_, _| Err(ConnectorError::Crm("HTTP 503".into())));

    let h = connected(Some(crm)).await;
    let event = text_event("IN-1", &phone_jid(CONTACT_PHONE), false, "Ciao");
    assert!(matches!(
        h.service.handle_message("t1", event).await.unwrap(),
        MessageOutcome::Stored { synced: false, .. }
    ));
    assert!(h.store.has_message("t1", "IN-1").await.unwrap());
}

// ============================================================================
// Delivery queue
// ============================================================================

#[tokio::test]
async fn test_queue_delivers_in_fifo_order() {
    let h = connected(None).await;
    let texts: Vec<String> = (1..=5).map(|i| format!("msg {}", i)).collect();
    for text in &texts {
        h.service
            .queue_message("t1", OutboundMessage::text(CONTACT_PHONE, text))
            .await
            .unwrap();
    }

    let session = h.session.clone();
    assert!(wait_for(|| session.send_count() == 5, Duration::from_secs(2)).await);
    assert_eq!(h.session.sent_texts(), texts);
    assert_eq!(h.service.get_queue_status("t1").length, 0);
}

#[tokio::test]
async fn test_queue_gives_up_after_three_attempts() {
    let h = connected(None).await;
    h.session.fail_sends.store(true, Ordering::SeqCst);
    h.service
        .queue_message("t1", OutboundMessage::text(CONTACT_PHONE, "doomed"))
        .await
        .unwrap();

    let session = h.session.clone();
    assert!(wait_for(|| session.send_count() >= 3, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.session.send_count(), 3);
    assert_eq!(h.service.get_queue_status("t1").length, 0);
}

#[tokio::test]
async fn test_drip_gap_respected() {
    let h = connected(None).await;
    h.service
        .set_rate_limit(
            "t1",
            RateLimitConfig {
                enabled: true,
                delay_between_messages_ms: 2000,
                jitter_ms: 0,
            },
        )
        .await
        .unwrap();
    for text in ["first", "second"] {
        h.service
            .queue_message("t1", OutboundMessage::text(CONTACT_PHONE, text))
            .await
            .unwrap();
    }

    let session = h.session.clone();
    assert!(wait_for(|| session.send_count() == 2, Duration::from_secs(4)).await);
    let sends = h.session.sends.lock().unwrap();
    let gap = sends[1].2.duration_since(sends[0].2);
    assert!(gap >= Duration::from_millis(2000), "gap was {:?}", gap);
}

#[tokio::test]
async fn test_paused_queue_holds_messages() {
    let h = connected(None).await;
    h.service.pause_queue("t1");
    h.service
        .queue_message("t1", OutboundMessage::text(CONTACT_PHONE, "later"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.send_count(), 0);
    let status = h.service.get_queue_status("t1");
    assert!(status.paused);
    assert_eq!(status.pending.len(), 1);

    h.service.resume_queue("t1");
    let session = h.session.clone();
    assert!(wait_for(|| session.send_count() == 1, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_queue_rejects_invalid_destination() {
    let h = connected(None).await;
    let err = h
        .service
        .queue_message("t1", OutboundMessage::text("not-a-number", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::InvalidInput(_)));
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_second_tenant_with_same_phone_is_torn_down() {
    let h = connected(None).await;
    h.store.save_sub_account(&SubAccount::new("t2")).await.unwrap();
    h.service.connect("t2").await.unwrap();

    let err = h
        .service
        .handle_event(open_event("t2", OWN_PHONE))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "phone_already_connected");

    let t2 = h.service.get_status("t2").await.unwrap();
    assert_eq!(t2.status, ConnectionStatus::Disconnected);
    assert!(h
        .session
        .disconnects
        .lock()
        .unwrap()
        .contains(&("t2".to_string(), true)));

    let t1 = h.service.get_status("t1").await.unwrap();
    assert_eq!(t1.status, ConnectionStatus::Connected);
    assert_eq!(t1.phone_number.as_deref(), Some(OWN_PHONE));
}

#[tokio::test]
async fn test_event_loop_drives_qr_flow() {
    let h = harness_with(test_config(), None).await;
    let (tx, rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.service.clone().run_event_loop(rx, shutdown_rx));

    h.service.connect("t1").await.unwrap();
    tx.send(SessionEvent::new("t1", SessionEventKind::Qr("2@abc".into())))
        .await
        .unwrap();

    let mut qr = None;
    for _ in 0..100 {
        qr = h.service.get_qr_code("t1").await.unwrap();
        if qr.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(qr.unwrap().data, "2@abc");
    assert_eq!(
        h.service.get_status("t1").await.unwrap().status,
        ConnectionStatus::QrReady
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_state_survives_restart_and_sessions_restore() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.json");

    {
        let store = Arc::new(MemoryStore::open(path.clone()).unwrap());
        store
            .save_sub_account(&SubAccount::new("t1").with_location("loc-1"))
            .await
            .unwrap();
        store.save_sub_account(&SubAccount::new("t2")).await.unwrap();
        let session = Arc::new(FakeSession::default());
        let service =
            ConnectorService::new(test_config(), store.clone(), session.clone(), None).unwrap();
        service.connect("t1").await.unwrap();
        service.handle_event(open_event("t1", OWN_PHONE)).await.unwrap();
        // t2 is stuck waiting for a scan when the process dies.
        service.connect("t2").await.unwrap();
        service
            .handle_event(SessionEvent::new("t2", SessionEventKind::Qr("2@x".into())))
            .await
            .unwrap();
        service
            .send_message("t1", OutboundMessage::text(CONTACT_PHONE, "Ciao"))
            .await
            .unwrap();
    }

    let store = Arc::new(MemoryStore::open(path).unwrap());
    assert!(store
        .find_mapping_by_phone("t1", CONTACT_PHONE)
        .await
        .unwrap()
        .is_some());

    let session = Arc::new(FakeSession::default());
    let service =
        ConnectorService::new(test_config(), store.clone(), session.clone(), None).unwrap();

    // No live session behind the persisted qr_ready.
    assert_eq!(
        service.get_status("t2").await.unwrap().status,
        ConnectionStatus::Disconnected
    );

    assert_eq!(service.restore_sessions().await.unwrap(), 1);
    assert_eq!(*session.connects.lock().unwrap(), vec!["t1".to_string()]);
}

#[tokio::test]
async fn test_logout_requires_fresh_connect() {
    let h = connected(None).await;
    h.service
        .handle_event(SessionEvent::new(
            "t1",
            SessionEventKind::Close(SessionError::LoggedOut("device removed".into())),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.connects.lock().unwrap().len(), 1);

    let err = h
        .service
        .send_message("t1", OutboundMessage::text(CONTACT_PHONE, "Ciao"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::NotConnected(_)));
}

#[tokio::test]
async fn test_network_drop_reconnects() {
    let h = connected(None).await;
    h.service
        .handle_event(SessionEvent::new(
            "t1",
            SessionEventKind::Close(SessionError::Network("reset by peer".into())),
        ))
        .await
        .unwrap();

    let session = h.session.clone();
    assert!(wait_for(|| session.connects.lock().unwrap().len() == 2, Duration::from_secs(1)).await);
}

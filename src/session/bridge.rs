//! WebSocket bridge session client.
//!
//! One WebSocket to an external bridge process carries every tenant's session.
//! Commands are correlated with their replies through a `request_id`; events
//! are pushed unsolicited.
//!
//! # Bridge Protocol (JSON over WebSocket)
//!
//! Connector → bridge:
//! ```json
//! {"type":"connect","request_id":"r1","tenant":"t1"}
//! {"type":"disconnect","request_id":"r2","tenant":"t1","logout":true}
//! {"type":"send","request_id":"r3","tenant":"t1","to":"393806510543@s.whatsapp.net","payload":{"type":"text","text":"Hi"}}
//! {"type":"lookup","request_id":"r4","tenant":"t1","phone":"393806510543"}
//! {"type":"replay","request_id":"r5","tenant":"t1","message_id":"wamid.1","payload":{}}
//! ```
//!
//! Bridge → connector:
//! ```json
//! {"type":"response","request_id":"r3","ok":true,"data":{"message_id":"wamid.2"}}
//! {"type":"response","request_id":"r4","ok":false,"error":{"kind":"timeout","message":"..."}}
//! {"type":"qr","tenant":"t1","data":"2@base64data"}
//! {"type":"connection","tenant":"t1","state":"open","phone":"393806510543"}
//! {"type":"connection","tenant":"t1","state":"close","error":{"kind":"logged_out","message":"401"}}
//! {"type":"message","tenant":"t1","event":{"id":"wamid.1","remoteJid":"...","message":{}}}
//! {"type":"retry_request","tenant":"t1","message_id":"wamid.1"}
//! ```

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::{classify_session_error, OutboundPayload, SessionClient, SessionEvent, SessionEventKind};
use crate::classify::RawEvent;
use crate::config::SessionConfig;
use crate::error::{ConnectorError, Result, SessionError};
use crate::identity::Jid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum reconnect delay (in seconds) for exponential backoff.
const MAX_RECONNECT_DELAY_SECS: u64 = 120;
/// Base reconnect delay (in seconds).
const BASE_RECONNECT_DELAY_SECS: u64 = 2;
/// Cap on the backoff exponent.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Outgoing frame buffer.
const OUTBOUND_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Bridge protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct BridgeErrorBody {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

impl BridgeErrorBody {
    fn into_session_error(self) -> SessionError {
        classify_session_error(&self.kind, &self.message)
    }
}

/// Frame received from the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Response {
        request_id: String,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        error: Option<BridgeErrorBody>,
    },
    Qr {
        tenant: String,
        data: String,
    },
    Connection {
        tenant: String,
        state: String,
        #[serde(default)]
        phone: Option<String>,
        #[serde(default)]
        error: Option<BridgeErrorBody>,
    },
    Message {
        tenant: String,
        event: RawEvent,
    },
    RetryRequest {
        tenant: String,
        message_id: String,
    },
}

/// Frame sent to the bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeRequest {
    Connect {
        request_id: String,
        tenant: String,
    },
    Disconnect {
        request_id: String,
        tenant: String,
        logout: bool,
    },
    Send {
        request_id: String,
        tenant: String,
        to: String,
        payload: OutboundPayload,
    },
    Lookup {
        request_id: String,
        tenant: String,
        phone: String,
    },
    Replay {
        request_id: String,
        tenant: String,
        message_id: String,
        payload: Value,
    },
}

type Reply = std::result::Result<Value, SessionError>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

/// Turn a frame into an event for the connector, or `None` for responses.
fn frame_to_event(frame: BridgeFrame) -> Option<SessionEvent> {
    match frame {
        BridgeFrame::Response { .. } => None,
        BridgeFrame::Qr { tenant, data } => {
            Some(SessionEvent::new(&tenant, SessionEventKind::Qr(data)))
        }
        BridgeFrame::Connection {
            tenant,
            state,
            phone,
            error,
        } => {
            let kind = match state.as_str() {
                "open" => match phone {
                    Some(phone) => SessionEventKind::Open { phone },
                    None => {
                        warn!("Bridge: open without phone for tenant {}", tenant);
                        return None;
                    }
                },
                "close" => SessionEventKind::Close(
                    error
                        .map(BridgeErrorBody::into_session_error)
                        .unwrap_or_else(|| SessionError::Unknown("closed".to_string())),
                ),
                other => {
                    debug!("Bridge: ignoring connection state '{}'", other);
                    return None;
                }
            };
            Some(SessionEvent::new(&tenant, kind))
        }
        BridgeFrame::Message { tenant, event } => {
            Some(SessionEvent::new(&tenant, SessionEventKind::Message(event)))
        }
        BridgeFrame::RetryRequest { tenant, message_id } => Some(SessionEvent::new(
            &tenant,
            SessionEventKind::RetryRequest { message_id },
        )),
    }
}

// ---------------------------------------------------------------------------
// BridgeSessionClient
// ---------------------------------------------------------------------------

/// [`SessionClient`] backed by the WebSocket bridge.
pub struct BridgeSessionClient {
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    pending: PendingMap,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    outbound_tx: Mutex<Option<mpsc::Sender<BridgeRequest>>>,
}

impl BridgeSessionClient {
    pub fn new(config: SessionConfig, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            config,
            events,
            pending: Arc::new(Mutex::new(HashMap::new())),
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            outbound_tx: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the bridge loop. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Bridge client already running");
            return Ok(());
        }

        let bridge_url = self.config.bridge_url.trim().to_string();
        if bridge_url.is_empty() {
            self.running.store(false, Ordering::SeqCst);
            return Err(ConnectorError::Config("session bridge URL is empty".to_string()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        *lock(&self.shutdown_tx) = Some(shutdown_tx);
        *lock(&self.outbound_tx) = Some(outbound_tx);

        info!("Starting session bridge client at {}", bridge_url);
        tokio::spawn(run_bridge_loop(
            bridge_url,
            self.events.clone(),
            Arc::clone(&self.pending),
            shutdown_rx,
            outbound_rx,
        ));
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = lock(&self.shutdown_tx).take() {
            let _ = tx.send(true);
        }
        lock(&self.outbound_tx).take();
        fail_pending(&self.pending, "bridge client stopped");
        info!("Session bridge client stopped");
    }

    /// Send a request and wait for its correlated response.
    async fn request(&self, request_id: String, frame: BridgeRequest) -> Result<Value> {
        let tx = lock(&self.outbound_tx)
            .clone()
            .ok_or_else(|| SessionError::Network("bridge client not running".to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), reply_tx);

        if tx.send(frame).await.is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(SessionError::Network("bridge loop is gone".to_string()).into());
        }

        let timeout = Duration::from_secs(self.config.request_timeout_secs.max(1));
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(SessionError::Network("bridge dropped the request".to_string()).into()),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                Err(SessionError::Timeout(format!(
                    "no bridge response within {}s",
                    timeout.as_secs()
                ))
                .into())
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Fail every request still waiting for a reply.
fn fail_pending(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = lock(pending).drain().collect();
    if !drained.is_empty() {
        debug!("Failing {} pending bridge requests: {}", drained.len(), reason);
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(SessionError::Network(reason.to_string())));
    }
}

/// Calculates the exponential backoff delay for a given attempt number.
fn backoff_delay(attempt: u32) -> Duration {
    let delay_secs = BASE_RECONNECT_DELAY_SECS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_RECONNECT_DELAY_SECS);
    Duration::from_secs(delay_secs)
}

/// Hands session events to the connector without ever blocking the reader.
///
/// Events that do not fit in the channel wait here, in order, until the
/// connector catches up. Replies to pending requests keep flowing meanwhile,
/// so a handler that awaits a bridge reply cannot stall its own input.
struct EventForwarder {
    events: mpsc::Sender<SessionEvent>,
    backlog: VecDeque<SessionEvent>,
}

impl EventForwarder {
    fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            events,
            backlog: VecDeque::new(),
        }
    }

    fn push(&mut self, event: SessionEvent) {
        self.backlog.push_back(event);
        self.flush();
        let len = self.backlog.len();
        if len == 1 || (len > 0 && len % 1000 == 0) {
            warn!("Bridge: event receiver is behind, {} events buffered", len);
        }
    }

    /// Move buffered events into the channel while it has room.
    fn flush(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    error!("Bridge: event receiver dropped");
                    self.backlog.clear();
                    return;
                }
            }
        }
    }

    fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }
}

/// Route one text frame: responses complete their pending request, events go
/// to the connector.
fn dispatch_frame(raw: &str, forwarder: &mut EventForwarder, pending: &PendingMap) {
    let frame = match serde_json::from_str::<BridgeFrame>(raw) {
        Ok(f) => f,
        Err(e) => {
            debug!("Bridge: unparseable frame: {}", e);
            return;
        }
    };

    if let BridgeFrame::Response {
        request_id,
        ok,
        data,
        error,
    } = frame
    {
        let reply = if ok {
            Ok(data)
        } else {
            Err(error
                .map(BridgeErrorBody::into_session_error)
                .unwrap_or_else(|| SessionError::Unknown("request failed".to_string())))
        };
        let waiter = lock(pending).remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("Bridge: late response for {}", request_id),
        }
        return;
    }

    if let Some(event) = frame_to_event(frame) {
        forwarder.push(event);
    }
}

/// Main bridge loop: connects, forwards requests, dispatches frames and
/// reconnects with exponential backoff.
async fn run_bridge_loop(
    bridge_url: String,
    events: mpsc::Sender<SessionEvent>,
    pending: PendingMap,
    mut shutdown_rx: watch::Receiver<bool>,
    mut outbound_rx: mpsc::Receiver<BridgeRequest>,
) {
    let mut reconnect_attempt: u32 = 0;
    let mut forwarder = EventForwarder::new(events.clone());

    loop {
        if *shutdown_rx.borrow() {
            info!("Bridge loop shutdown requested");
            return;
        }

        let ws_stream = tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Bridge loop shutdown requested");
                return;
            }
            result = connect_async(&bridge_url) => {
                match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Bridge connect failed: {}", e);
                        let delay = backoff_delay(reconnect_attempt);
                        reconnect_attempt = (reconnect_attempt + 1).min(MAX_RECONNECT_ATTEMPTS);
                        tokio::select! {
                            _ = shutdown_rx.changed() => return,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                }
            }
        };

        info!("Bridge WebSocket connected to {}", bridge_url);
        reconnect_attempt = 0;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Bridge loop shutdown requested");
                    let _ = ws_writer.send(WsMessage::Close(None)).await;
                    return;
                }

                outbound = outbound_rx.recv() => {
                    let Some(request) = outbound else {
                        debug!("Bridge outbound channel closed");
                        return;
                    };
                    match serde_json::to_string(&request) {
                        Ok(json) => {
                            if let Err(e) = ws_writer.send(WsMessage::Text(json.into())).await {
                                warn!("Bridge send failed: {}", e);
                                break;
                            }
                        }
                        Err(e) => error!("Bridge: failed to serialize request: {}", e),
                    }
                }

                permit = events.reserve(), if forwarder.has_backlog() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(event) = forwarder.backlog.pop_front() {
                                permit.send(event);
                            }
                            forwarder.flush();
                        }
                        Err(_) => forwarder.flush(),
                    }
                }

                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(raw))) => {
                            dispatch_frame(raw.as_str(), &mut forwarder, &pending);
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if let Err(e) = ws_writer.send(WsMessage::Pong(payload)).await {
                                warn!("Bridge pong failed: {}", e);
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!("Bridge WebSocket closed: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Bridge WebSocket error: {}", e);
                            break;
                        }
                        None => {
                            warn!("Bridge WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
        }

        // Replies to anything in flight will never arrive on the new socket.
        fail_pending(&pending, "bridge connection lost");

        let delay = backoff_delay(reconnect_attempt);
        reconnect_attempt = (reconnect_attempt + 1).min(MAX_RECONNECT_ATTEMPTS);
        info!("Reconnecting to bridge in {} seconds", delay.as_secs());
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(delay) => {},
        }
    }
}

// ---------------------------------------------------------------------------
// SessionClient implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl SessionClient for BridgeSessionClient {
    async fn connect(&self, tenant_id: &str) -> Result<()> {
        let request_id = new_request_id();
        self.request(
            request_id.clone(),
            BridgeRequest::Connect {
                request_id,
                tenant: tenant_id.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn disconnect(&self, tenant_id: &str, logout: bool) -> Result<()> {
        let request_id = new_request_id();
        self.request(
            request_id.clone(),
            BridgeRequest::Disconnect {
                request_id,
                tenant: tenant_id.to_string(),
                logout,
            },
        )
        .await?;
        Ok(())
    }

    async fn send(&self, tenant_id: &str, to: &Jid, payload: &OutboundPayload) -> Result<String> {
        let request_id = new_request_id();
        let data = self
            .request(
                request_id.clone(),
                BridgeRequest::Send {
                    request_id,
                    tenant: tenant_id.to_string(),
                    to: to.to_string(),
                    payload: payload.clone(),
                },
            )
            .await?;
        data.get("message_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                SessionError::Unknown("send response without message_id".to_string()).into()
            })
    }

    async fn lookup_identifier(&self, tenant_id: &str, phone: &str) -> Result<Option<String>> {
        let request_id = new_request_id();
        let data = self
            .request(
                request_id.clone(),
                BridgeRequest::Lookup {
                    request_id,
                    tenant: tenant_id.to_string(),
                    phone: phone.to_string(),
                },
            )
            .await?;
        Ok(data.get("lid").and_then(Value::as_str).map(str::to_string))
    }

    async fn replay(&self, tenant_id: &str, message_id: &str, payload: &Value) -> Result<()> {
        let request_id = new_request_id();
        self.request(
            request_id.clone(),
            BridgeRequest::Replay {
                request_id,
                tenant: tenant_id.to_string(),
                message_id: message_id.to_string(),
                payload: payload.clone(),
            },
        )
        .await?;
        Ok(())
    }
}

impl Drop for BridgeSessionClient {
    fn drop(&mut self) {
        self.stop();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

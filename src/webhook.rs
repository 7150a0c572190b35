//! Tenant webhook dispatcher.
//!
//! Connection events (QR ready, connected, disconnected, errors) are POSTed to
//! the tenant's webhook URL as JSON, signed with HMAC-SHA256 over the raw body:
//!
//! ```text
//! X-Webhook-Event: connection.error
//! X-Webhook-Signature: sha256=<hex>
//! ```
//!
//! Dispatch never blocks the caller. A tenant whose endpoint fails
//! `max_consecutive_failures` times in a row is skipped until
//! [`WebhookDispatcher::reset`] is called.

use chrono::Utc;
use ring::hmac;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::error::{ConnectorError, Result};
use crate::log_component;
use crate::store::WebhookTarget;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Body of every webhook call.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEnvelope<'a> {
    pub event: &'a str,
    pub tenant_id: &'a str,
    pub timestamp: String,
    pub data: &'a Value,
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    format!("sha256={}", hex::encode(tag.as_ref()))
}

/// Check a `sha256=<hex>` header against `body` in constant time.
pub fn verify(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig) = hex::decode(hex_sig) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &sig).is_ok()
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: WebhookConfig,
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            config,
            failures: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True once a tenant hit the consecutive failure limit.
    pub fn is_disabled(&self, tenant_id: &str) -> bool {
        self.failures().get(tenant_id).copied().unwrap_or(0) >= self.config.max_consecutive_failures
    }

    pub fn consecutive_failures(&self, tenant_id: &str) -> u32 {
        self.failures().get(tenant_id).copied().unwrap_or(0)
    }

    /// Re-enable a tenant's webhook.
    pub fn reset(&self, tenant_id: &str) {
        self.failures().remove(tenant_id);
    }

    pub fn remove_tenant(&self, tenant_id: &str) {
        self.reset(tenant_id);
    }

    /// Fire and forget. Returns immediately; delivery happens on a spawned task.
    pub fn trigger(
        &self,
        target: Option<&WebhookTarget>,
        tenant_id: &str,
        event: &str,
        data: Value,
    ) {
        if !self.config.enabled {
            return;
        }
        let Some(target) = target.cloned() else {
            return;
        };
        let this = self.clone();
        let tenant_id = tenant_id.to_string();
        let event = event.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.deliver(&target, &tenant_id, &event, &data).await {
                debug!("Webhook {} for tenant {} not delivered: {}", event, tenant_id, e);
            }
        });
    }

    /// Deliver one webhook and update the tenant's failure counter.
    pub async fn deliver(
        &self,
        target: &WebhookTarget,
        tenant_id: &str,
        event: &str,
        data: &Value,
    ) -> Result<()> {
        if self.is_disabled(tenant_id) {
            return Err(ConnectorError::InvalidInput(format!(
                "webhook disabled for tenant {} after repeated failures",
                tenant_id
            )));
        }

        let body = serde_json::to_vec(&WebhookEnvelope {
            event,
            tenant_id,
            timestamp: Utc::now().to_rfc3339(),
            data,
        })?;
        let signature = sign(&target.secret, &body);

        let result = self
            .client
            .post(&target.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, event)
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => {
                self.failures().remove(tenant_id);
                log_component!(debug, "webhook", "delivered", tenant = tenant_id, event = event);
                Ok(())
            }
            Err(e) => {
                let count = {
                    let mut failures = self.failures();
                    let count = failures.entry(tenant_id.to_string()).or_insert(0);
                    *count += 1;
                    *count
                };
                if count >= self.config.max_consecutive_failures {
                    warn!(
                        "Webhook for tenant {} disabled after {} consecutive failures",
                        tenant_id, count
                    );
                } else {
                    warn!(
                        "Webhook {} for tenant {} failed ({}/{}): {}",
                        event, tenant_id, count, self.config.max_consecutive_failures, e
                    );
                }
                Err(e.into())
            }
        }
    }
}

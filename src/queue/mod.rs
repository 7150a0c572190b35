//! Queue module - per-tenant outbound delivery in drip mode
//!
//! Each tenant gets its own FIFO and at most one worker task. The worker sends
//! one entry at a time through the injected [`OutboundSender`] and waits
//! `delay_between_messages_ms` plus a random jitter between two sends, so a
//! burst from the CRM never reaches WhatsApp as a burst.
//!
//! A failed send goes back to the tail with its attempt counter bumped; after
//! `max_attempts` failures the entry is dropped and logged. Errors that cannot
//! succeed on a second try (a rejected recipient, invalid input) drop the entry
//! at once. Pausing stops the worker before its next dequeue, the send in
//! flight always completes.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use wa_crm_bridge::config::QueueConfig;
//! use wa_crm_bridge::error::Result;
//! use wa_crm_bridge::queue::{DeliveryQueue, OutboundSender, QueueEntry};
//! use wa_crm_bridge::store::ContentKind;
//!
//! struct Print;
//!
//! #[async_trait]
//! impl OutboundSender for Print {
//!     async fn deliver(&self, entry: &QueueEntry) -> Result<String> {
//!         println!("-> {}: {}", entry.to, entry.content);
//!         Ok(format!("wamid.{}", entry.id))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = DeliveryQueue::new(Arc::new(Print), &QueueConfig::default());
//!     let entry = QueueEntry::new("t1", "393806510543", "Hello", ContentKind::Text);
//!     let id = queue.enqueue(entry).unwrap();
//!     assert!(!id.is_empty());
//! }
//! ```

pub mod types;

pub use types::{PendingEntry, QueueEntry, QueueState, QueueStatus};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use crate::config::{QueueConfig, RateLimitConfig};
use crate::error::{ConnectorError, Result};
use crate::log_component;
use crate::utils::string::mask_phone;

/// Capability the queue uses to put an entry on the wire.
///
/// Returns the provider message id on success.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn deliver(&self, entry: &QueueEntry) -> Result<String>;
}

#[derive(Debug)]
struct TenantQueue {
    /// Identifies this queue instance; a worker only serves the epoch it was
    /// spawned for, so a removed and re-created tenant never shares workers.
    epoch: u64,
    entries: VecDeque<QueueEntry>,
    rate_limit: RateLimitConfig,
    processing: bool,
    paused: bool,
    worker_running: bool,
    /// When the previous send finished
    last_send: Option<Instant>,
    /// Gap chosen for the next send; reset after each send and on rate change
    next_gap: Option<Duration>,
}

impl TenantQueue {
    fn new(epoch: u64, rate_limit: RateLimitConfig) -> Self {
        Self {
            epoch,
            entries: VecDeque::new(),
            rate_limit,
            processing: false,
            paused: false,
            worker_running: false,
            last_send: None,
            next_gap: None,
        }
    }

    fn state(&self) -> QueueState {
        if self.paused {
            QueueState::Paused
        } else if self.processing || self.worker_running {
            QueueState::Processing
        } else {
            QueueState::Idle
        }
    }

    /// Time left before the next send is allowed.
    fn wait_remaining(&mut self, now: Instant) -> Duration {
        if !self.rate_limit.enabled {
            return Duration::ZERO;
        }
        let Some(last) = self.last_send else {
            return Duration::ZERO;
        };
        let rate = self.rate_limit;
        let gap = *self.next_gap.get_or_insert_with(|| {
            Duration::from_millis(
                rate.delay_between_messages_ms
                    .saturating_add(jitter_ms(rate.jitter_ms)),
            )
        });
        (last + gap).saturating_duration_since(now)
    }
}

/// Random value in `[0, max)` taken from the clock's nanosecond component.
fn jitter_ms(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % max)
        .unwrap_or(0)
}

struct Inner {
    sender: Arc<dyn OutboundSender>,
    max_attempts: u32,
    default_rate_limit: RateLimitConfig,
    tenants: Mutex<HashMap<String, TenantQueue>>,
    next_epoch: AtomicU64,
    /// Held around every send. Outlives `remove_tenant` so the worker of a
    /// re-created queue waits for the previous worker's send in flight.
    send_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TenantQueue>> {
        self.tenants.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_lock(&self, tenant_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.send_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(tenant_id.to_string()).or_default())
    }

    /// The tenant's queue, created with `rate_limit` if missing.
    fn queue_mut<'a>(
        &self,
        tenants: &'a mut HashMap<String, TenantQueue>,
        tenant_id: &str,
        rate_limit: RateLimitConfig,
    ) -> &'a mut TenantQueue {
        tenants.entry(tenant_id.to_string()).or_insert_with(|| {
            TenantQueue::new(self.next_epoch.fetch_add(1, Ordering::Relaxed), rate_limit)
        })
    }
}

/// Per-tenant FIFO outbound queue with drip-mode rate limiting.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

enum Step {
    Send(QueueEntry),
    Wait(Duration),
    Stop,
}

impl DeliveryQueue {
    pub fn new(sender: Arc<dyn OutboundSender>, config: &QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sender,
                max_attempts: config.max_attempts.max(1),
                default_rate_limit: config.default_rate_limit,
                tenants: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
                send_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Append an entry to its tenant's queue and make sure a worker runs.
    ///
    /// Returns the entry id.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<String> {
        if entry.to.trim().is_empty() {
            return Err(ConnectorError::InvalidInput(
                "destination is empty".to_string(),
            ));
        }
        if entry.content.trim().is_empty() && entry.media_url.is_none() {
            return Err(ConnectorError::InvalidInput(
                "message has neither content nor media".to_string(),
            ));
        }

        let id = entry.id.clone();
        let tenant_id = entry.tenant_id.clone();
        let spawn = {
            let mut tenants = self.inner.lock();
            let q = self
                .inner
                .queue_mut(&mut tenants, &tenant_id, self.inner.default_rate_limit);
            q.entries.push_back(entry);
            log_component!(
                debug,
                "queue",
                "message enqueued",
                tenant = tenant_id.as_str(),
                length = q.entries.len()
            );
            Self::claim_worker(q)
        };
        if let Some(epoch) = spawn {
            self.spawn_worker(tenant_id, epoch);
        }
        Ok(id)
    }

    /// Mark the worker as running if one should start. Caller holds the lock.
    ///
    /// Returns the epoch the new worker serves.
    fn claim_worker(q: &mut TenantQueue) -> Option<u64> {
        if q.paused || q.worker_running || q.entries.is_empty() {
            return None;
        }
        q.worker_running = true;
        Some(q.epoch)
    }

    fn spawn_worker(&self, tenant_id: String, epoch: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_worker(inner, tenant_id, epoch).await;
        });
    }

    /// Stop dequeuing for a tenant. The send in flight, if any, completes.
    pub fn pause(&self, tenant_id: &str) {
        let mut tenants = self.inner.lock();
        let q = self
            .inner
            .queue_mut(&mut tenants, tenant_id, self.inner.default_rate_limit);
        q.paused = true;
        log_component!(info, "queue", "queue paused", tenant = tenant_id);
    }

    /// Resume a paused queue, restarting the worker if entries are pending.
    pub fn resume(&self, tenant_id: &str) {
        let spawn = {
            let mut tenants = self.inner.lock();
            match tenants.get_mut(tenant_id) {
                Some(q) => {
                    q.paused = false;
                    log_component!(
                        info,
                        "queue",
                        "queue resumed",
                        tenant = tenant_id,
                        length = q.entries.len()
                    );
                    Self::claim_worker(q)
                }
                None => None,
            }
        };
        if let Some(epoch) = spawn {
            self.spawn_worker(tenant_id.to_string(), epoch);
        }
    }

    /// Drop every pending entry. Returns how many were removed.
    pub fn clear(&self, tenant_id: &str) -> usize {
        let mut tenants = self.inner.lock();
        let count = tenants
            .get_mut(tenant_id)
            .map(|q| {
                let n = q.entries.len();
                q.entries.clear();
                n
            })
            .unwrap_or(0);
        if count > 0 {
            log_component!(info, "queue", "queue cleared", tenant = tenant_id, dropped = count);
        }
        count
    }

    pub fn status(&self, tenant_id: &str) -> QueueStatus {
        let tenants = self.inner.lock();
        match tenants.get(tenant_id) {
            Some(q) => QueueStatus {
                tenant_id: tenant_id.to_string(),
                state: q.state(),
                length: q.entries.len(),
                processing: q.processing,
                paused: q.paused,
                rate_limit: q.rate_limit,
                pending: q.entries.iter().map(PendingEntry::from).collect(),
            },
            None => QueueStatus {
                tenant_id: tenant_id.to_string(),
                state: QueueState::Idle,
                length: 0,
                processing: false,
                paused: false,
                rate_limit: self.inner.default_rate_limit,
                pending: Vec::new(),
            },
        }
    }

    /// Replace a tenant's rate limit. Applies from the next dequeue.
    pub fn set_rate_limit(&self, tenant_id: &str, rate_limit: RateLimitConfig) {
        let mut tenants = self.inner.lock();
        let q = self.inner.queue_mut(&mut tenants, tenant_id, rate_limit);
        q.rate_limit = rate_limit;
        q.next_gap = None;
    }

    #[cfg(test)]
    fn has_tenant(&self, tenant_id: &str) -> bool {
        self.inner.lock().contains_key(tenant_id)
    }

    /// Forget a tenant. Its worker exits after the send in flight, even if
    /// the tenant is enqueued again in the meantime.
    pub fn remove_tenant(&self, tenant_id: &str) -> usize {
        let removed = self.inner.lock().remove(tenant_id);
        removed.map(|q| q.entries.len()).unwrap_or(0)
    }
}

async fn run_worker(inner: Arc<Inner>, tenant_id: String, epoch: u64) {
    debug!("Queue worker started for tenant {} (epoch {})", tenant_id, epoch);
    let send_lock = inner.send_lock(&tenant_id);
    loop {
        let step = {
            let mut tenants = inner.lock();
            match tenants.get_mut(&tenant_id).filter(|q| q.epoch == epoch) {
                None => Step::Stop,
                Some(q) if q.paused || q.entries.is_empty() => {
                    q.worker_running = false;
                    q.processing = false;
                    Step::Stop
                }
                Some(q) => {
                    let wait = q.wait_remaining(Instant::now());
                    if wait > Duration::ZERO {
                        Step::Wait(wait)
                    } else {
                        match q.entries.pop_front() {
                            Some(entry) => {
                                q.processing = true;
                                Step::Send(entry)
                            }
                            None => Step::Stop,
                        }
                    }
                }
            }
        };

        let mut entry = match step {
            Step::Stop => break,
            Step::Wait(d) => {
                tokio::time::sleep(d).await;
                continue;
            }
            Step::Send(entry) => entry,
        };

        let result = {
            let _sending = send_lock.lock().await;
            inner.sender.deliver(&entry).await
        };

        let mut tenants = inner.lock();
        let Some(q) = tenants.get_mut(&tenant_id).filter(|q| q.epoch == epoch) else {
            debug!("Tenant {} removed while sending, worker exits", tenant_id);
            break;
        };
        q.processing = false;
        q.last_send = Some(Instant::now());
        q.next_gap = None;

        match result {
            Ok(provider_id) => {
                log_component!(
                    debug,
                    "queue",
                    "message delivered",
                    tenant = tenant_id.as_str(),
                    entry = entry.id.as_str(),
                    provider_id = provider_id.as_str()
                );
            }
            Err(e) => {
                entry.attempts += 1;
                if !e.is_retryable() {
                    error!(
                        "Tenant {}: send to {} failed permanently, dropped: {}",
                        tenant_id,
                        mask_phone(&entry.to),
                        e
                    );
                } else if entry.attempts < inner.max_attempts {
                    warn!(
                        "Tenant {}: send to {} failed (attempt {}/{}), requeued: {}",
                        tenant_id,
                        mask_phone(&entry.to),
                        entry.attempts,
                        inner.max_attempts,
                        e
                    );
                    q.entries.push_back(entry);
                } else {
                    error!(
                        "Tenant {}: send to {} permanently failed after {} attempts, dropped: {}",
                        tenant_id,
                        mask_phone(&entry.to),
                        entry.attempts,
                        e
                    );
                }
            }
        }
    }
    debug!("Queue worker stopped for tenant {}", tenant_id);
}

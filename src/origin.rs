//! Origin tracker: tells our own sends apart from the operator's other devices.
//!
//! Every message this connector sends comes back from the session as a
//! `from_me` event. Those echoes must not be synced to the CRM a second time,
//! while a `from_me` message typed on the operator's phone must be. A send
//! leaves a short-lived mark on (tenant, phone); an outbound event that finds a
//! live mark is an echo.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct OriginTracker {
    ttl: Duration,
    marks: Mutex<HashMap<(String, String), Instant>>,
}

impl OriginTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Record that the system just sent to `phone`.
    pub fn mark(&self, tenant_id: &str, phone: &str) {
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        marks.insert((tenant_id.to_string(), phone.to_string()), Instant::now());
    }

    /// True if a mark younger than the TTL exists. An expired mark is removed.
    pub fn is_origin(&self, tenant_id: &str, phone: &str) -> bool {
        let key = (tenant_id.to_string(), phone.to_string());
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        match marks.get(&key) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                marks.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Drop every expired mark. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        let before = marks.len();
        marks.retain(|_, at| at.elapsed() < ttl);
        before - marks.len()
    }

    pub fn remove_tenant(&self, tenant_id: &str) {
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        marks.retain(|(t, _), _| t != tenant_id);
    }

    pub fn len(&self) -> usize {
        self.marks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` flips to true.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use std::time::Duration;
    /// # use wa_crm_bridge::origin::OriginTracker;
    /// # tokio_test::block_on(async {
    /// let tracker = Arc::new(OriginTracker::new(Duration::from_millis(10)));
    /// let (stop, rx) = tokio::sync::watch::channel(false);
    /// let sweeper = tracker.spawn_sweeper(Duration::from_millis(5), rx);
    ///
    /// tracker.mark("t1", "393806510543");
    /// tokio::time::sleep(Duration::from_millis(50)).await;
    /// assert!(tracker.is_empty());
    ///
    /// stop.send(true).unwrap();
    /// sweeper.await.unwrap();
    /// # });
    /// ```
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let removed = tracker.sweep();
                        if removed > 0 {
                            debug!("Origin sweep removed {} expired marks", removed);
                        }
                    }
                }
            }
        })
    }
}

//! Store module - durable state shared by the core
//!
//! Three tables live behind the [`Store`] trait:
//! - sub-accounts (tenants) and their connection status
//! - WhatsApp identity mappings, unique on (tenant, phone)
//! - message records, unique on (tenant, provider message id)
//!
//! Writes use upsert semantics on those keys so concurrent handlers racing on
//! the same key converge instead of duplicating.
//!
//! # Example
//!
//! ```
//! use wa_crm_bridge::store::{MemoryStore, MappingUpsert, Store};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     store
//!         .upsert_mapping(MappingUpsert::new("t1", "393806510543").whatsapp_id("250830569660605"))
//!         .await
//!         .unwrap();
//!     let row = store.find_mapping_by_whatsapp_id("t1", "250830569660605").await.unwrap();
//!     assert_eq!(row.unwrap().phone_number, "393806510543");
//! }
//! ```

pub mod types;

pub use types::{
    ConnectionStatus, ContentKind, DeliveryStatus, Direction, MappingUpsert, MessageRecord,
    SubAccount, WebhookTarget, WhatsAppMapping,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};

/// Persistence interface consumed by the core.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_sub_account(&self, id: &str) -> Result<Option<SubAccount>>;

    async fn list_sub_accounts(&self) -> Result<Vec<SubAccount>>;

    /// Insert or replace a tenant by id.
    async fn save_sub_account(&self, sub: &SubAccount) -> Result<()>;

    async fn delete_sub_account(&self, id: &str) -> Result<bool>;

    /// Find another tenant currently `connected` with the given phone.
    async fn find_connected_by_phone(
        &self,
        phone: &str,
        exclude_tenant: &str,
    ) -> Result<Option<SubAccount>>;

    async fn find_mapping_by_whatsapp_id(
        &self,
        tenant_id: &str,
        whatsapp_id: &str,
    ) -> Result<Option<WhatsAppMapping>>;

    async fn find_mapping_by_phone(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<WhatsAppMapping>>;

    /// Rows with no opaque id whose last activity is at or after `since`.
    async fn unmapped_mappings_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WhatsAppMapping>>;

    /// Merge into the (tenant, phone) row, creating it if needed, and touch
    /// its activity timestamp.
    ///
    /// Binding an opaque id that another row of the same tenant holds moves
    /// it: an opaque id maps to at most one phone per tenant.
    async fn upsert_mapping(&self, upsert: MappingUpsert) -> Result<WhatsAppMapping>;

    async fn has_message(&self, tenant_id: &str, message_id: &str) -> Result<bool>;

    async fn get_message(&self, tenant_id: &str, message_id: &str)
        -> Result<Option<MessageRecord>>;

    /// Insert a message record. Returns `false` (and stores nothing) if the
    /// (tenant, provider message id) pair already exists.
    async fn insert_message(&self, record: MessageRecord) -> Result<bool>;
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    sub_accounts: HashMap<String, SubAccount>,
    /// (tenant, phone) → mapping
    mappings: HashMap<(String, String), WhatsAppMapping>,
    /// (tenant, provider message id) → record
    messages: HashMap<(String, String), MessageRecord>,
}

/// On-disk form of [`Tables`]; tuple keys do not survive JSON.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    sub_accounts: Vec<SubAccount>,
    #[serde(default)]
    mappings: Vec<WhatsAppMapping>,
    #[serde(default)]
    messages: Vec<MessageRecord>,
}

impl From<Snapshot> for Tables {
    fn from(s: Snapshot) -> Self {
        Self {
            sub_accounts: s.sub_accounts.into_iter().map(|a| (a.id.clone(), a)).collect(),
            mappings: s
                .mappings
                .into_iter()
                .map(|m| ((m.tenant_id.clone(), m.phone_number.clone()), m))
                .collect(),
            messages: s
                .messages
                .into_iter()
                .map(|m| ((m.tenant_id.clone(), m.message_id.clone()), m))
                .collect(),
        }
    }
}

impl Tables {
    /// Past `limit` records, drop the oldest down to 90% of it. Returns how
    /// many were removed.
    fn prune_messages(&mut self, limit: usize) -> usize {
        if limit == 0 || self.messages.len() <= limit {
            return 0;
        }
        let keep = limit - limit / 10;
        let excess = self.messages.len() - keep;
        let mut by_age: Vec<(DateTime<Utc>, (String, String))> = self
            .messages
            .iter()
            .map(|(key, record)| (record.created_at, key.clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(excess) {
            self.messages.remove(&key);
        }
        excess
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            sub_accounts: self.sub_accounts.values().cloned().collect(),
            mappings: self.mappings.values().cloned().collect(),
            messages: self.messages.values().cloned().collect(),
        }
    }
}

/// In-memory store with an optional JSON snapshot file.
///
/// With a path, every write rewrites the snapshot (write to a temp file, then
/// rename) while holding the write lock, so the file always reflects a
/// consistent state. The message table is bounded by
/// [`with_message_limit`](Self::with_message_limit), which keeps the snapshot
/// from growing with the whole history.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
    max_messages: usize,
}

impl MemoryStore {
    /// Create a store without persistence.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot_path: None,
            max_messages: 0,
        }
    }

    /// Keep at most `limit` message records (0 = unlimited).
    ///
    /// Once the limit is passed, the oldest records are dropped down to 90%
    /// of it. A pruned id is no longer recognized as a replay.
    pub fn with_message_limit(mut self, limit: usize) -> Self {
        self.max_messages = limit;
        self
    }

    /// Open (or create) a store persisted at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: PathBuf) -> Result<Self> {
        let tables = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content).map_err(|e| {
                ConnectorError::Store(format!("corrupt snapshot {}: {}", path.display(), e))
            })?;
            Tables::from(snapshot)
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Tables::default()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            snapshot_path: Some(path),
            max_messages: 0,
        })
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(ref path) = self.snapshot_path else {
            return Ok(());
        };
        let content = serde_json::to_string(&tables.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Store snapshot written to {}", path.display());
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_sub_account(&self, id: &str) -> Result<Option<SubAccount>> {
        Ok(self.tables.read().await.sub_accounts.get(id).cloned())
    }

    async fn list_sub_accounts(&self) -> Result<Vec<SubAccount>> {
        let tables = self.tables.read().await;
        let mut subs: Vec<SubAccount> = tables.sub_accounts.values().cloned().collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subs)
    }

    async fn save_sub_account(&self, sub: &SubAccount) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.sub_accounts.insert(sub.id.clone(), sub.clone());
        self.persist(&tables).await
    }

    async fn delete_sub_account(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let removed = tables.sub_accounts.remove(id).is_some();
        if removed {
            self.persist(&tables).await?;
        }
        Ok(removed)
    }

    async fn find_connected_by_phone(
        &self,
        phone: &str,
        exclude_tenant: &str,
    ) -> Result<Option<SubAccount>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sub_accounts
            .values()
            .find(|s| {
                s.id != exclude_tenant
                    && s.status == ConnectionStatus::Connected
                    && s.phone_number.as_deref() == Some(phone)
            })
            .cloned())
    }

    async fn find_mapping_by_whatsapp_id(
        &self,
        tenant_id: &str,
        whatsapp_id: &str,
    ) -> Result<Option<WhatsAppMapping>> {
        let tables = self.tables.read().await;
        Ok(tables
            .mappings
            .values()
            .find(|m| m.tenant_id == tenant_id && m.whatsapp_id.as_deref() == Some(whatsapp_id))
            .cloned())
    }

    async fn find_mapping_by_phone(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<WhatsAppMapping>> {
        let tables = self.tables.read().await;
        Ok(tables
            .mappings
            .get(&(tenant_id.to_string(), phone.to_string()))
            .cloned())
    }

    async fn unmapped_mappings_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WhatsAppMapping>> {
        let tables = self.tables.read().await;
        Ok(tables
            .mappings
            .values()
            .filter(|m| {
                m.tenant_id == tenant_id && m.whatsapp_id.is_none() && m.last_activity >= since
            })
            .cloned()
            .collect())
    }

    async fn upsert_mapping(&self, upsert: MappingUpsert) -> Result<WhatsAppMapping> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();

        if let Some(ref wid) = upsert.whatsapp_id {
            for row in tables.mappings.values_mut() {
                if row.tenant_id == upsert.tenant_id
                    && row.phone_number != upsert.phone_number
                    && row.whatsapp_id.as_deref() == Some(wid.as_str())
                {
                    warn!(
                        "Opaque id {} moved from {} to {} for tenant {}",
                        wid, row.phone_number, upsert.phone_number, upsert.tenant_id
                    );
                    row.whatsapp_id = None;
                }
            }
        }

        let key = (upsert.tenant_id.clone(), upsert.phone_number.clone());
        let row = tables.mappings.entry(key).or_insert_with(|| WhatsAppMapping {
            tenant_id: upsert.tenant_id.clone(),
            phone_number: upsert.phone_number.clone(),
            whatsapp_id: None,
            contact_name: None,
            last_activity: now,
        });
        if upsert.whatsapp_id.is_some() {
            row.whatsapp_id = upsert.whatsapp_id;
        }
        if upsert.contact_name.is_some() {
            row.contact_name = upsert.contact_name;
        }
        row.last_activity = now;
        let result = row.clone();

        self.persist(&tables).await?;
        Ok(result)
    }

    async fn has_message(&self, tenant_id: &str, message_id: &str) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .contains_key(&(tenant_id.to_string(), message_id.to_string())))
    }

    async fn get_message(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .get(&(tenant_id.to_string(), message_id.to_string()))
            .cloned())
    }

    async fn insert_message(&self, record: MessageRecord) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let key = (record.tenant_id.clone(), record.message_id.clone());
        if tables.messages.contains_key(&key) {
            return Ok(false);
        }
        tables.messages.insert(key, record);
        let pruned = tables.prune_messages(self.max_messages);
        if pruned > 0 {
            debug!("Pruned {} old message records", pruned);
        }
        self.persist(&tables).await?;
        Ok(true)
    }
}

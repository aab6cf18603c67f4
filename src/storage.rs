use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{Message, MessageId, Page, Tenant, TenantId};

pub type StoreResult<T> = Result<T, StoreError>;

/// Name of the tenant's message partition.
///
/// Tenant ids are opaque and case-sensitive, so the name is a name-based
/// UUID of the id rather than a sanitized copy of it. It always fits the
/// 63-byte identifier limit of Postgres.
pub fn partition_name(tenant_id: &TenantId) -> String {
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, tenant_id.as_str().as_bytes());
    format!("messages_{}", digest.simple())
}

/// Persistence gateway over the shared relational store.
///
/// Tenant records are managed independently of message data: deleting a
/// tenant record leaves its messages in place.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotently create the tenant's message partition.
    async fn ensure_partition(&self, tenant_id: &TenantId) -> StoreResult<()>;

    /// Insert a message. Inserting the same id twice is a no-op.
    async fn insert_message(&self, message: &Message) -> StoreResult<()>;

    /// Messages with id strictly greater than `cursor`, ascending by id.
    ///
    /// `next_cursor` is the last id of a full page and `None` on a short one.
    async fn list_messages(
        &self,
        tenant_id: &TenantId,
        cursor: Option<MessageId>,
        limit: usize,
    ) -> StoreResult<Page>;

    /// Insert the tenant record if absent; an existing record is left as is.
    async fn create_tenant(&self, tenant: &Tenant) -> StoreResult<()>;

    async fn delete_tenant(&self, tenant_id: &TenantId) -> StoreResult<()>;

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>>;

    async fn update_concurrency(&self, tenant_id: &TenantId, concurrency: usize) -> StoreResult<()>;
}

/// In-memory storage for lightweight deployments and tests.
///
/// Partitions behave like list partitions: inserting for a tenant whose
/// partition was never ensured fails.
#[derive(Default)]
pub struct InMemoryStore {
    partitions: RwLock<HashMap<TenantId, BTreeMap<MessageId, Message>>>,
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored for a tenant.
    pub async fn message_count(&self, tenant_id: &TenantId) -> usize {
        self.partitions
            .read()
            .await
            .get(tenant_id)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    pub async fn tenant(&self, tenant_id: &TenantId) -> Option<Tenant> {
        self.tenants.read().await.get(tenant_id).cloned()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ensure_partition(&self, tenant_id: &TenantId) -> StoreResult<()> {
        self.partitions
            .write()
            .await
            .entry(tenant_id.clone())
            .or_default();
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let mut guard = self.partitions.write().await;
        let partition = guard
            .get_mut(&message.tenant_id)
            .ok_or_else(|| StoreError::MissingPartition(message.tenant_id.clone()))?;
        partition
            .entry(message.id)
            .or_insert_with(|| message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        tenant_id: &TenantId,
        cursor: Option<MessageId>,
        limit: usize,
    ) -> StoreResult<Page> {
        if limit == 0 {
            return Err(StoreError::InvalidLimit(limit));
        }

        let guard = self.partitions.read().await;
        let Some(partition) = guard.get(tenant_id) else {
            return Ok(Page::default());
        };

        let lower = match cursor {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let messages: Vec<Message> = partition
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect();

        let next_cursor = if messages.len() == limit {
            messages.last().map(|m| m.id)
        } else {
            None
        };
        Ok(Page {
            messages,
            next_cursor,
        })
    }

    async fn create_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        self.tenants
            .write()
            .await
            .entry(tenant.id.clone())
            .or_insert_with(|| tenant.clone());
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: &TenantId) -> StoreResult<()> {
        self.tenants.write().await.remove(tenant_id);
        Ok(())
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self.tenants.read().await.values().cloned().collect();
        tenants.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tenants)
    }

    async fn update_concurrency(&self, tenant_id: &TenantId, concurrency: usize) -> StoreResult<()> {
        // Matches an UPDATE that hits no row: silently nothing.
        if let Some(tenant) = self.tenants.write().await.get_mut(tenant_id) {
            tenant.concurrency = concurrency;
        }
        Ok(())
    }
}

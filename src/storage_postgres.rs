use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::storage::{partition_name, Store, StoreResult};
use crate::types::{Message, MessageId, Page, Tenant, TenantId};

/// Postgres-backed persistence gateway.
///
/// Messages live in one table list-partitioned by tenant; each tenant gets
/// its own partition. The caller owns the connection task driving `client`.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS tenants (
                    id TEXT PRIMARY KEY,
                    concurrency INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS messages (
                    id UUID NOT NULL,
                    tenant_id TEXT NOT NULL,
                    payload BYTEA NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (tenant_id, id)
                ) PARTITION BY LIST (tenant_id)",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn quote_literal(value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn message_from_row(row: &Row) -> Result<Message, tokio_postgres::Error> {
        let id: Uuid = row.try_get(0)?;
        let tenant_id: String = row.try_get(1)?;
        let payload: Vec<u8> = row.try_get(2)?;
        let created_at: DateTime<Utc> = row.try_get(3)?;
        Ok(Message {
            id: MessageId(id),
            tenant_id: TenantId(tenant_id),
            payload,
            created_at,
        })
    }

    fn tenant_from_row(row: &Row) -> Result<Tenant, tokio_postgres::Error> {
        let id: String = row.try_get(0)?;
        let concurrency: i32 = row.try_get(1)?;
        let created_at: DateTime<Utc> = row.try_get(2)?;
        Ok(Tenant {
            id: TenantId(id),
            concurrency: usize::try_from(concurrency).unwrap_or_default(),
            created_at,
        })
    }
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl Store for PostgresStore {
    async fn ensure_partition(&self, tenant_id: &TenantId) -> StoreResult<()> {
        // Partition bounds cannot be bind parameters.
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF messages FOR VALUES IN ({})",
            Self::quote_ident(&partition_name(tenant_id)),
            Self::quote_literal(tenant_id.as_str()),
        );
        self.client.batch_execute(&query).await?;
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let result = self
            .client
            .execute(
                "INSERT INTO messages (id, tenant_id, payload, created_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (tenant_id, id) DO NOTHING",
                &[
                    &message.id.0,
                    &message.tenant_id.0,
                    &message.payload,
                    &message.created_at,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // 23514: no partition of relation "messages" found for row
            Err(err)
                if err.code() == Some(&tokio_postgres::error::SqlState::CHECK_VIOLATION) =>
            {
                Err(StoreError::MissingPartition(message.tenant_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
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
        let cursor: Option<Uuid> = cursor.map(|c| c.0);
        let limit_param = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self
            .client
            .query(
                "SELECT id, tenant_id, payload, created_at
                 FROM messages
                 WHERE tenant_id = $1
                   AND ($2::uuid IS NULL OR id > $2::uuid)
                 ORDER BY id
                 LIMIT $3",
                &[&tenant_id.0, &cursor, &limit_param],
            )
            .await?;

        let messages = rows
            .iter()
            .map(Self::message_from_row)
            .collect::<Result<Vec<_>, _>>()?;

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
        self.client
            .execute(
                "INSERT INTO tenants (id, concurrency, created_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO NOTHING",
                &[&tenant.id.0, &to_i32(tenant.concurrency), &tenant.created_at],
            )
            .await?;
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: &TenantId) -> StoreResult<()> {
        self.client
            .execute("DELETE FROM tenants WHERE id = $1", &[&tenant_id.0])
            .await?;
        Ok(())
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let rows = self
            .client
            .query(
                "SELECT id, concurrency, created_at FROM tenants ORDER BY created_at",
                &[],
            )
            .await?;

        let tenants = rows
            .iter()
            .map(Self::tenant_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tenants)
    }

    async fn update_concurrency(&self, tenant_id: &TenantId, concurrency: usize) -> StoreResult<()> {
        self.client
            .execute(
                "UPDATE tenants SET concurrency = $1 WHERE id = $2",
                &[&to_i32(concurrency), &tenant_id.0],
            )
            .await?;
        Ok(())
    }
}

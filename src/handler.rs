use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::IgnoredAny;

use crate::broker::Delivery;
use crate::error::ProcessingError;
use crate::storage::Store;
use crate::types::{Message, TenantId};

/// Per-delivery processing invoked by a pipeline.
///
/// The handler only reports an outcome; the pipeline owns the disposition:
/// `Ok` commits the delivery, `Err` rejects it to the dead-letter queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, tenant_id: &TenantId, delivery: &Delivery) -> Result<(), ProcessingError>;
}

/// Validates the payload as JSON and persists it as a [`Message`].
pub struct PersistHandler {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl PersistHandler {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl DeliveryHandler for PersistHandler {
    async fn handle(&self, tenant_id: &TenantId, delivery: &Delivery) -> Result<(), ProcessingError> {
        serde_json::from_slice::<IgnoredAny>(delivery.payload())?;

        let message = Message::new(
            tenant_id.clone(),
            delivery.payload(),
            delivery.timestamp().unwrap_or_else(Utc::now),
        );

        tokio::time::timeout(self.timeout, self.store.insert_message(&message))
            .await
            .map_err(|_| ProcessingError::Timeout(self.timeout))??;

        tracing::debug!(tenant = %tenant_id, message_id = %message.id, "message persisted");
        Ok(())
    }
}

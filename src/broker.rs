//! Broker gateway: per-tenant queues over one shared broker connection.
//!
//! Every tenant gets a durable main queue paired with a durable dead-letter
//! queue. Rejecting a delivery without requeue routes it to the dead-letter
//! queue; there is no other retry path.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BrokerError;
use crate::types::TenantId;

pub fn queue_name(tenant_id: &TenantId) -> String {
    format!("tenant_{}_queue", tenant_id)
}

pub fn dead_letter_queue_name(tenant_id: &TenantId) -> String {
    format!("tenant_{}_dlq", tenant_id)
}

pub fn consumer_tag(tenant_id: &TenantId) -> String {
    format!("consumer-{}", tenant_id)
}

/// Terminal disposition of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge: the broker forgets the message.
    Commit,
    /// Negative-acknowledge without requeue: routed to the dead-letter queue.
    Reject,
}

/// Broker-side half of a delivery, able to settle it exactly once.
#[async_trait]
pub trait Settle: Send + Sync {
    async fn settle(&self, tag: u64, disposition: Disposition) -> Result<(), BrokerError>;
}

/// One message handed out by the broker, awaiting a terminal disposition.
///
/// [`ack`](Delivery::ack) and [`reject`](Delivery::reject) consume the
/// delivery, so it cannot be settled twice. A delivery dropped unsettled goes
/// back to its queue.
pub struct Delivery {
    tag: u64,
    payload: Vec<u8>,
    timestamp: Option<DateTime<Utc>>,
    settler: Box<dyn Settle>,
}

impl Delivery {
    pub fn new(
        tag: u64,
        payload: Vec<u8>,
        timestamp: Option<DateTime<Utc>>,
        settler: impl Settle + 'static,
    ) -> Self {
        Self {
            tag,
            payload,
            timestamp,
            settler: Box::new(settler),
        }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Publish time as stamped by the producer, if any.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.settler.settle(self.tag, Disposition::Commit).await
    }

    pub async fn reject(self) -> Result<(), BrokerError> {
        self.settler.settle(self.tag, Disposition::Reject).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Manual-acknowledgment delivery stream for one tenant queue.
///
/// Owned by exactly one pipeline. `next` must be cancel-safe: it is raced
/// against the pipeline's stop signal.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or `None` once the stream is cancelled or the queue is gone.
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Stop receiving new deliveries. Deliveries already handed out can
    /// still be settled.
    async fn cancel(&mut self) -> Result<(), BrokerError>;

    /// Release the stream's channel. Call only after every delivery it
    /// produced has been settled.
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Transactional wrapper over one shared broker connection.
///
/// Safe to call concurrently for different tenants. Calls for the same
/// tenant are serialized by the registry, not here.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotently declare the tenant's main queue and its dead-letter queue.
    async fn declare_queue(&self, tenant_id: &TenantId) -> Result<(), BrokerError>;

    /// Delete the tenant's main queue. The dead-letter queue is kept.
    async fn delete_queue(&self, tenant_id: &TenantId) -> Result<(), BrokerError>;

    async fn publish(&self, tenant_id: &TenantId, payload: &[u8]) -> Result<(), BrokerError>;

    /// Open a delivery stream on the tenant's main queue, independently
    /// cancellable from every other tenant's stream.
    async fn consume(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// Current number of ready messages in the tenant's main queue.
    async fn inspect_depth(&self, tenant_id: &TenantId) -> Result<u32, BrokerError>;
}

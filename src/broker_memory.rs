use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::broker::{
    dead_letter_queue_name, queue_name, Broker, Delivery, DeliveryStream, Disposition, Settle,
};
use crate::error::BrokerError;
use crate::types::TenantId;

/// In-process broker with AMQP-like queue semantics.
///
/// Intended for tests, demos and embedded use. Mirrors what the relay
/// relies on from a real broker:
/// - Manual acknowledgment, one terminal disposition per delivery
/// - Reject routes to the paired dead-letter queue
/// - An unsettled delivery that is dropped goes back to the head of its queue
#[derive(Default)]
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    next_tag: Arc<AtomicU64>,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub acked: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    acked: u64,
}

struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
    deleted: AtomicBool,
    dead_letter: Option<Arc<Queue>>,
}

impl Queue {
    fn new(dead_letter: Option<Arc<Queue>>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            deleted: AtomicBool::new(false),
            dead_letter,
        }
    }

    fn push(&self, message: StoredMessage) {
        self.state.lock().ready.push_back(message);
        self.notify.notify_one();
    }

    fn take(&self, tag: u64) -> Option<StoredMessage> {
        let mut state = self.state.lock();
        let message = state.ready.pop_front()?;
        state.unacked.insert(tag, message.clone());
        Some(message)
    }

    fn settle(&self, tag: u64, disposition: Disposition) -> Result<(), BrokerError> {
        let message = {
            let mut state = self.state.lock();
            let message = state
                .unacked
                .remove(&tag)
                .ok_or_else(|| BrokerError::Disconnected(format!("unknown delivery tag {tag}")))?;
            if disposition == Disposition::Commit {
                state.acked += 1;
            }
            message
        };

        if disposition == Disposition::Reject {
            if let Some(dlq) = &self.dead_letter {
                dlq.push(message);
            }
        }
        Ok(())
    }

    fn requeue(&self, tag: u64) {
        let mut state = self.state.lock();
        if let Some(message) = state.unacked.remove(&tag) {
            state.ready.push_front(message);
            drop(state);
            self.notify.notify_one();
        }
    }

    fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            ready: state.ready.len(),
            unacked: state.unacked.len(),
            acked: state.acked,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>, BrokerError> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    /// Counters for the tenant's main queue, if declared.
    pub fn stats(&self, tenant_id: &TenantId) -> Option<QueueStats> {
        self.queues.read().get(&queue_name(tenant_id)).map(|q| q.stats())
    }

    /// Payloads currently sitting in the tenant's dead-letter queue.
    pub fn dead_letters(&self, tenant_id: &TenantId) -> Vec<Vec<u8>> {
        let guard = self.queues.read();
        let Some(dlq) = guard.get(&dead_letter_queue_name(tenant_id)) else {
            return Vec::new();
        };
        let state = dlq.state.lock();
        state.ready.iter().map(|m| m.payload.clone()).collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, tenant_id: &TenantId) -> Result<(), BrokerError> {
        let name = queue_name(tenant_id);
        let dlq_name = dead_letter_queue_name(tenant_id);

        let mut guard = self.queues.write();
        if guard.contains_key(&name) {
            return Ok(());
        }
        let dlq = guard
            .entry(dlq_name)
            .or_insert_with(|| Arc::new(Queue::new(None)))
            .clone();
        guard.insert(name, Arc::new(Queue::new(Some(dlq))));
        Ok(())
    }

    async fn delete_queue(&self, tenant_id: &TenantId) -> Result<(), BrokerError> {
        let name = queue_name(tenant_id);
        let queue = self
            .queues
            .write()
            .remove(&name)
            .ok_or(BrokerError::QueueNotFound(name))?;
        queue.deleted.store(true, Ordering::SeqCst);
        queue.notify.notify_waiters();
        queue.notify.notify_one();
        Ok(())
    }

    async fn publish(&self, tenant_id: &TenantId, payload: &[u8]) -> Result<(), BrokerError> {
        let queue = self.queue(&queue_name(tenant_id))?;
        queue.push(StoredMessage {
            payload: payload.to_vec(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn consume(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let queue = self.queue(&queue_name(tenant_id))?;
        Ok(Box::new(InMemoryStream {
            queue,
            tags: self.next_tag.clone(),
            cancelled: false,
        }))
    }

    async fn inspect_depth(&self, tenant_id: &TenantId) -> Result<u32, BrokerError> {
        let queue = self.queue(&queue_name(tenant_id))?;
        let depth = queue.state.lock().ready.len();
        Ok(u32::try_from(depth).unwrap_or(u32::MAX))
    }
}

struct InMemoryStream {
    queue: Arc<Queue>,
    tags: Arc<AtomicU64>,
    cancelled: bool,
}

#[async_trait]
impl DeliveryStream for InMemoryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            if self.cancelled || self.queue.deleted.load(Ordering::SeqCst) {
                return None;
            }

            // notify_one leaves a permit behind if nobody is waiting yet,
            // so a push between `take` and the await is not missed.
            let notified = self.queue.notify.notified();
            let tag = self.tags.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(message) = self.queue.take(tag) {
                let settler = InMemorySettler {
                    queue: self.queue.clone(),
                    tag,
                    settled: AtomicBool::new(false),
                };
                return Some(Ok(Delivery::new(
                    tag,
                    message.payload,
                    Some(message.timestamp),
                    settler,
                )));
            }
            notified.await;
        }
    }

    async fn cancel(&mut self) -> Result<(), BrokerError> {
        self.cancelled = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.cancelled = true;
        Ok(())
    }
}

struct InMemorySettler {
    queue: Arc<Queue>,
    tag: u64,
    settled: AtomicBool,
}

#[async_trait]
impl Settle for InMemorySettler {
    async fn settle(&self, tag: u64, disposition: Disposition) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Disconnected(format!(
                "delivery tag {tag} already settled"
            )));
        }
        self.queue.settle(tag, disposition)
    }
}

impl Drop for InMemorySettler {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.queue.requeue(self.tag);
        }
    }
}

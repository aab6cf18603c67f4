#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use tenant_relay::{
    Delivery, DeliveryHandler, InMemoryStore, Message, MessageId, Page, ProcessingError,
    RelayMetrics, Store, StoreError, StoreResult, Tenant, TenantId,
};

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// In-memory store with switchable failures and an optional gate that
/// holds every `insert_message` until opened.
#[derive(Default)]
pub struct TestStore {
    pub inner: InMemoryStore,
    pub fail_partition: AtomicBool,
    pub fail_tenant_record: AtomicBool,
    pub fail_insert: AtomicBool,
    pub fail_concurrency: AtomicBool,
    gate: Option<CancellationToken>,
    pub entered: AtomicUsize,
    pub completed: AtomicUsize,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(CancellationToken::new()),
            ..Self::default()
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.cancel();
        }
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn injected() -> StoreError {
        StoreError::Unavailable("injected failure".to_string())
    }
}

#[async_trait]
impl Store for TestStore {
    async fn ensure_partition(&self, tenant_id: &TenantId) -> StoreResult<()> {
        if self.fail_partition.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.ensure_partition(tenant_id).await
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.cancelled().await;
        }
        let result = if self.fail_insert.load(Ordering::SeqCst) {
            Err(Self::injected())
        } else {
            self.inner.insert_message(message).await
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn list_messages(
        &self,
        tenant_id: &TenantId,
        cursor: Option<MessageId>,
        limit: usize,
    ) -> StoreResult<Page> {
        self.inner.list_messages(tenant_id, cursor, limit).await
    }

    async fn create_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        if self.fail_tenant_record.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.create_tenant(tenant).await
    }

    async fn delete_tenant(&self, tenant_id: &TenantId) -> StoreResult<()> {
        self.inner.delete_tenant(tenant_id).await
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        self.inner.list_tenants().await
    }

    async fn update_concurrency(&self, tenant_id: &TenantId, concurrency: usize) -> StoreResult<()> {
        if self.fail_concurrency.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.update_concurrency(tenant_id, concurrency).await
    }
}

/// Handler that records what it sees and blocks until released.
///
/// Each invocation consumes one permit from `release`.
pub struct RecordingHandler {
    pub current: AtomicUsize,
    pub max: AtomicUsize,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<Vec<u8>>>,
    pub release: Semaphore,
    fail: bool,
}

impl RecordingHandler {
    /// Blocks every invocation until `release` gets permits.
    pub fn blocking() -> Self {
        Self::build(0, false)
    }

    /// Never blocks.
    pub fn passing() -> Self {
        Self::build(Semaphore::MAX_PERMITS, false)
    }

    /// Never blocks, always fails.
    pub fn failing() -> Self {
        Self::build(Semaphore::MAX_PERMITS, true)
    }

    fn build(permits: usize, fail: bool) -> Self {
        Self {
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            release: Semaphore::new(permits),
            fail,
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn handle(&self, _tenant_id: &TenantId, delivery: &Delivery) -> Result<(), ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().push(delivery.payload().to_vec());

        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }

        self.current.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            Err(ProcessingError::Timeout(Duration::from_millis(1)))
        } else {
            Ok(())
        }
    }
}

/// Metrics sink that keeps counts for assertions.
#[derive(Default)]
pub struct RecordingMetrics {
    pub processed: AtomicUsize,
    pub rejected: AtomicUsize,
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    pub depths: Mutex<Vec<(TenantId, u32)>>,
}

impl RecordingMetrics {
    pub fn last_depth(&self, tenant_id: &TenantId) -> Option<u32> {
        self.depths
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == tenant_id)
            .map(|(_, depth)| *depth)
    }
}

impl RelayMetrics for RecordingMetrics {
    fn message_processed(&self, _tenant_id: &TenantId) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    fn message_rejected(&self, _tenant_id: &TenantId) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn handler_started(&self, _tenant_id: &TenantId) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn handler_finished(&self, _tenant_id: &TenantId) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn queue_depth(&self, tenant_id: &TenantId, depth: u32) {
        self.depths.lock().push((tenant_id.clone(), depth));
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::error::{ProvisionStep, RegistryError};
use crate::handler::{DeliveryHandler, PersistHandler};
use crate::pipeline::Pipeline;
use crate::storage::Store;
use crate::telemetry::{NoopMetrics, RelayMetrics};
use crate::types::{MessageId, Page, Tenant, TenantId};

/// Map from tenant to its running pipeline.
///
/// Every mutating operation holds the map's write lock for its whole
/// duration, so a tenant is either fully provisioned and registered or not
/// present at all. Enumeration takes the read lock. Resizing touches only
/// the pipeline's own limiter and never waits on a drain.
///
/// A pipeline whose delivery stream ends without a stop request (queue
/// deleted, channel lost) is deregistered by a watcher task. Until the
/// watcher gets the lock, every operation treats it as absent.
pub struct Registry {
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    handler: Arc<dyn DeliveryHandler>,
    metrics: Arc<dyn RelayMetrics>,
    config: RelayConfig,
    pipelines: PipelineMap,
    closed: AtomicBool,
}

type PipelineMap = Arc<RwLock<HashMap<TenantId, Arc<Pipeline>>>>;

impl Registry {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn Store>, config: RelayConfig) -> Self {
        let handler: Arc<dyn DeliveryHandler> =
            Arc::new(PersistHandler::new(store.clone(), config.persist_timeout()));
        Self {
            broker,
            store,
            handler,
            metrics: Arc::new(NoopMetrics),
            config,
            pipelines: Arc::new(RwLock::new(HashMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the per-delivery handler (persistence by default).
    pub fn with_handler(mut self, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Provision a tenant with the configured default concurrency.
    pub async fn add_tenant(&self, tenant_id: &TenantId) -> Result<(), RegistryError> {
        self.add_tenant_with_concurrency(tenant_id, self.config.default_concurrency)
            .await
    }

    /// Provision a tenant: storage partition, queues, pipeline, tenant record.
    ///
    /// A no-op if the tenant already has a live pipeline; a pipeline whose
    /// stream has ended is replaced. Any failed step aborts the whole
    /// operation with nothing registered. Partitions and queues created
    /// before the failure stay; creating them is idempotent.
    pub async fn add_tenant_with_concurrency(
        &self,
        tenant_id: &TenantId,
        concurrency: usize,
    ) -> Result<(), RegistryError> {
        if tenant_id.as_str().is_empty() {
            return Err(RegistryError::InvalidTenantId);
        }
        if concurrency == 0 {
            return Err(RegistryError::InvalidSlotCount(concurrency));
        }

        let mut guard = self.pipelines.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::ShutDown);
        }
        if let Some(existing) = guard.get(tenant_id).cloned() {
            if !existing.is_terminated() {
                return Ok(());
            }
            guard.remove(tenant_id);
            existing.stop().await;
            tracing::info!(tenant = %tenant_id, "replacing terminated pipeline");
        }

        self.store
            .ensure_partition(tenant_id)
            .await
            .map_err(|e| RegistryError::provisioning(tenant_id, ProvisionStep::Partition, e))?;

        self.broker
            .declare_queue(tenant_id)
            .await
            .map_err(|e| RegistryError::provisioning(tenant_id, ProvisionStep::Queue, e))?;

        let pipeline = Arc::new(Pipeline::new(
            tenant_id.clone(),
            concurrency,
            self.handler.clone(),
            self.metrics.clone(),
        ));
        pipeline
            .start(self.broker.as_ref())
            .await
            .map_err(|e| RegistryError::provisioning(tenant_id, ProvisionStep::Consumer, e))?;

        let record = Tenant::new(tenant_id.clone(), concurrency);
        if let Err(err) = self.store.create_tenant(&record).await {
            pipeline.stop().await;
            return Err(RegistryError::provisioning(
                tenant_id,
                ProvisionStep::TenantRecord,
                err,
            ));
        }

        guard.insert(tenant_id.clone(), pipeline.clone());
        watch_pipeline(self.pipelines.clone(), pipeline);
        tracing::info!(tenant = %tenant_id, concurrency, "tenant added");
        Ok(())
    }

    /// Stop the tenant's pipeline and clean up its queue and record.
    ///
    /// Returns `false` if the tenant was not registered. Blocks until every
    /// in-flight delivery has been settled. Cleanup failures are logged;
    /// the tenant counts as removed once its pipeline has stopped.
    pub async fn remove_tenant(&self, tenant_id: &TenantId) -> bool {
        let mut guard = self.pipelines.write().await;
        let Some(pipeline) = guard.remove(tenant_id) else {
            return false;
        };

        pipeline.stop().await;

        if let Err(err) = self.broker.delete_queue(tenant_id).await {
            tracing::warn!(tenant = %tenant_id, error = %err, "failed to delete tenant queue");
        }
        if let Err(err) = self.store.delete_tenant(tenant_id).await {
            tracing::warn!(tenant = %tenant_id, error = %err, "failed to remove tenant record");
        }

        tracing::info!(tenant = %tenant_id, "tenant removed");
        true
    }

    /// Resize the tenant's handler pool and persist the new concurrency.
    ///
    /// If persisting fails the live pipeline keeps the new size; the
    /// persisted value is reconciled on the next restart.
    pub async fn set_worker_count(
        &self,
        tenant_id: &TenantId,
        slots: usize,
    ) -> Result<(), RegistryError> {
        if slots == 0 {
            return Err(RegistryError::InvalidSlotCount(slots));
        }

        let guard = self.pipelines.write().await;
        let pipeline = guard
            .get(tenant_id)
            .filter(|p| !p.is_terminated())
            .ok_or_else(|| RegistryError::NotFound(tenant_id.clone()))?;

        pipeline.resize(slots);

        self.store
            .update_concurrency(tenant_id, slots)
            .await
            .map_err(|source| RegistryError::PersistConcurrency {
                tenant: tenant_id.clone(),
                source,
            })
    }

    /// Snapshot of registered tenant ids, in no particular order.
    pub async fn list_tenant_ids(&self) -> Vec<TenantId> {
        self.pipelines
            .read()
            .await
            .iter()
            .filter(|(_, p)| !p.is_terminated())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn contains(&self, tenant_id: &TenantId) -> bool {
        self.live(tenant_id).await.is_some()
    }

    /// Live slot count of the tenant's pipeline.
    pub async fn concurrency(&self, tenant_id: &TenantId) -> Option<usize> {
        self.live(tenant_id).await.map(|p| p.slots())
    }

    pub async fn active_handlers(&self, tenant_id: &TenantId) -> Option<usize> {
        self.live(tenant_id).await.map(|p| p.active_handlers())
    }

    async fn live(&self, tenant_id: &TenantId) -> Option<Arc<Pipeline>> {
        self.pipelines
            .read()
            .await
            .get(tenant_id)
            .filter(|p| !p.is_terminated())
            .cloned()
    }

    /// Cursor-paginated message listing, delegated to the store.
    pub async fn list_messages(
        &self,
        tenant_id: &TenantId,
        cursor: Option<MessageId>,
        limit: usize,
    ) -> Result<Page, RegistryError> {
        Ok(self.store.list_messages(tenant_id, cursor, limit).await?)
    }

    /// Stop every pipeline concurrently and empty the registry.
    ///
    /// Each pipeline is fully drained before this returns. Afterwards the
    /// registry refuses new tenants.
    pub async fn shutdown_all(&self) {
        let mut guard = self.pipelines.write().await;
        self.closed.store(true, Ordering::SeqCst);

        let pipelines: Vec<Arc<Pipeline>> = guard.drain().map(|(_, p)| p).collect();
        let count = pipelines.len();
        join_all(pipelines.iter().map(|p| p.stop())).await;

        tracing::info!(stopped = count, "all tenant pipelines stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Re-add every persisted tenant with its persisted concurrency.
    ///
    /// A tenant that fails to provision is logged and skipped. Returns how
    /// many persisted tenants are running afterwards.
    pub async fn recover(&self) -> Result<usize, RegistryError> {
        let tenants = self.store.list_tenants().await?;
        let mut recovered = 0usize;

        for tenant in tenants {
            let concurrency = if tenant.concurrency == 0 {
                self.config.default_concurrency
            } else {
                tenant.concurrency
            };
            match self.add_tenant_with_concurrency(&tenant.id, concurrency).await {
                Ok(()) => {
                    recovered += 1;
                    tracing::info!(tenant = %tenant.id, concurrency, "recovered tenant");
                }
                Err(err) => {
                    tracing::warn!(tenant = %tenant.id, error = %err, "failed to recover tenant");
                }
            }
        }
        Ok(recovered)
    }

    /// Report every registered tenant's queue depth to the metrics sink.
    ///
    /// Ids are snapshotted under the read lock; the broker is queried after
    /// it is released.
    pub async fn sample_queue_depths(&self) {
        for tenant_id in self.list_tenant_ids().await {
            match self.broker.inspect_depth(&tenant_id).await {
                Ok(depth) => self.metrics.queue_depth(&tenant_id, depth),
                Err(err) => {
                    tracing::warn!(tenant = %tenant_id, error = %err, "failed to inspect queue depth");
                }
            }
        }
    }
}

/// Deregister `pipeline` if its dispatch loop returns without a stop request.
///
/// Only removes the exact pipeline it watches; a replacement registered in
/// the meantime is left alone.
fn watch_pipeline(pipelines: PipelineMap, pipeline: Arc<Pipeline>) {
    tokio::spawn(async move {
        pipeline.terminated().await;
        if pipeline.stop_requested() {
            return;
        }

        let tenant_id = pipeline.tenant_id().clone();
        let mut guard = pipelines.write().await;
        let registered = guard
            .get(&tenant_id)
            .is_some_and(|p| Arc::ptr_eq(p, &pipeline));
        if registered {
            guard.remove(&tenant_id);
            drop(guard);
            pipeline.stop().await;
            tracing::error!(
                tenant = %tenant_id,
                "delivery stream ended unexpectedly; tenant deregistered until re-added"
            );
        }
    });
}

/// Periodically sample queue depths until `shutdown` is cancelled.
pub fn spawn_depth_sampler(
    registry: Arc<Registry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => registry.sample_queue_depths().await,
            }
        }
    })
}

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Delivery, DeliveryStream};
use crate::error::BrokerError;
use crate::handler::DeliveryHandler;
use crate::slots::{SlotLimiter, SlotPermit};
use crate::telemetry::RelayMetrics;
use crate::types::TenantId;

/// Lifecycle of a pipeline.
///
/// `Created → Running → Draining → Stopped`. A pipeline that is stopped
/// before it was ever started goes straight to `Stopped`. A pipeline whose
/// delivery stream ends on its own drains and reaches `Stopped` without a
/// stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Created => write!(f, "created"),
            PipelineState::Running => write!(f, "running"),
            PipelineState::Draining => write!(f, "draining"),
            PipelineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// One tenant's consumption unit: a delivery stream feeding a bounded pool
/// of handler slots.
///
/// The pipeline owns its stream; the broker it was started from is only
/// used to open it.
pub struct Pipeline {
    ctx: Arc<DispatchContext>,
    shutdown: CancellationToken,
    dispatch: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Context shared by the pipeline handle, its dispatch loop and handlers.
struct DispatchContext {
    tenant_id: TenantId,
    limiter: Arc<SlotLimiter>,
    handler: Arc<dyn DeliveryHandler>,
    metrics: Arc<dyn RelayMetrics>,
    active: AtomicUsize,
    state: Mutex<PipelineState>,
    /// Cancelled once the dispatch loop has fully drained and returned.
    exited: CancellationToken,
}

impl DispatchContext {
    fn set_state(&self, state: PipelineState) {
        *self.state.lock() = state;
    }
}

impl Pipeline {
    pub fn new(
        tenant_id: TenantId,
        slots: usize,
        handler: Arc<dyn DeliveryHandler>,
        metrics: Arc<dyn RelayMetrics>,
    ) -> Self {
        Self {
            ctx: Arc::new(DispatchContext {
                tenant_id,
                limiter: SlotLimiter::new(slots),
                handler,
                metrics,
                active: AtomicUsize::new(0),
                state: Mutex::new(PipelineState::Created),
                exited: CancellationToken::new(),
            }),
            shutdown: CancellationToken::new(),
            dispatch: tokio::sync::Mutex::new(None),
        }
    }

    /// Open the tenant's delivery stream and launch the dispatch loop.
    ///
    /// Only a `Created` pipeline starts; otherwise this is a no-op. If the
    /// stream cannot be opened the pipeline stays `Created`.
    pub async fn start(&self, broker: &dyn Broker) -> Result<(), BrokerError> {
        let mut dispatch = self.dispatch.lock().await;
        if self.state() != PipelineState::Created {
            return Ok(());
        }

        let stream = broker.consume(&self.ctx.tenant_id).await?;
        self.ctx.set_state(PipelineState::Running);
        *dispatch = Some(tokio::spawn(dispatch_loop(
            self.ctx.clone(),
            stream,
            self.shutdown.clone(),
        )));

        tracing::info!(
            tenant = %self.ctx.tenant_id,
            slots = self.ctx.limiter.slots(),
            "pipeline started"
        );
        Ok(())
    }

    /// Stop consuming and wait until every delivery already pulled from the
    /// broker has been committed or rejected.
    ///
    /// Concurrent callers all return once the pipeline is `Stopped`.
    pub async fn stop(&self) {
        let mut dispatch = self.dispatch.lock().await;
        let Some(handle) = dispatch.take() else {
            self.ctx.set_state(PipelineState::Stopped);
            return;
        };

        {
            let mut state = self.ctx.state.lock();
            if *state == PipelineState::Running {
                *state = PipelineState::Draining;
            }
        }
        self.shutdown.cancel();
        if let Err(err) = handle.await {
            tracing::error!(tenant = %self.ctx.tenant_id, error = %err, "dispatch loop failed");
        }
        self.ctx.set_state(PipelineState::Stopped);

        tracing::info!(tenant = %self.ctx.tenant_id, "pipeline stopped");
    }

    /// Change the number of handler slots without pausing consumption.
    ///
    /// Returns `false` for zero or for the current count. Handlers already
    /// running keep their slot; a shrink takes effect as they finish.
    pub fn resize(&self, slots: usize) -> bool {
        match self.ctx.limiter.resize(slots) {
            Some(previous) => {
                tracing::info!(
                    tenant = %self.ctx.tenant_id,
                    from = previous,
                    to = slots,
                    "rescaled handler slots"
                );
                true
            }
            None => false,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.ctx.tenant_id
    }

    pub fn slots(&self) -> usize {
        self.ctx.limiter.slots()
    }

    /// Handler invocations currently in progress.
    pub fn active_handlers(&self) -> usize {
        self.ctx.active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PipelineState {
        *self.ctx.state.lock()
    }

    /// Whether the dispatch loop has returned, for any reason.
    pub fn is_terminated(&self) -> bool {
        self.ctx.exited.is_cancelled()
    }

    /// Wait until the dispatch loop has returned. Resolves immediately if it
    /// already has; never resolves for a pipeline that was never started.
    pub async fn terminated(&self) {
        self.ctx.exited.cancelled().await;
    }

    /// Whether `stop` has been requested.
    pub fn stop_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Main dispatch loop.
///
/// - Pulls deliveries until stopped or the stream ends
/// - A pulled delivery waits for a free slot, then always runs; stop never
///   abandons it
/// - On exit cancels the stream, drains every handler, then closes it
/// - Marks the pipeline `Stopped` and signals `exited` last
async fn dispatch_loop(
    ctx: Arc<DispatchContext>,
    mut stream: Box<dyn DeliveryStream>,
    shutdown: CancellationToken,
) {
    let mut handlers = JoinSet::new();
    let mut requested = false;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                requested = true;
                break;
            }

            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                report_join(&ctx.tenant_id, joined);
            }

            next = stream.next() => match next {
                Some(Ok(delivery)) => {
                    let permit = match ctx.limiter.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            // Unsettled deliveries go back to the queue when dropped.
                            tracing::error!(tenant = %ctx.tenant_id, "slot limiter closed");
                            break;
                        }
                    };
                    handlers.spawn(process_delivery(ctx.clone(), delivery, permit));
                }
                Some(Err(err)) => {
                    tracing::error!(tenant = %ctx.tenant_id, error = %err, "delivery stream failed");
                    break;
                }
                None => {
                    tracing::warn!(tenant = %ctx.tenant_id, "delivery stream ended");
                    break;
                }
            }
        }
    }

    if !requested {
        ctx.set_state(PipelineState::Draining);
    }

    if let Err(err) = stream.cancel().await {
        tracing::warn!(tenant = %ctx.tenant_id, error = %err, "failed to cancel delivery stream");
    }

    while let Some(joined) = handlers.join_next().await {
        report_join(&ctx.tenant_id, joined);
    }

    if let Err(err) = stream.close().await {
        tracing::warn!(tenant = %ctx.tenant_id, error = %err, "failed to close delivery stream");
    }

    ctx.set_state(PipelineState::Stopped);
    ctx.exited.cancel();
}

fn report_join(tenant_id: &TenantId, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::error!(tenant = %tenant_id, error = %err, "handler task failed");
    }
}

/// Run the handler for one delivery and settle it.
///
/// Commit follows a successful handler, reject follows a failed one; the
/// slot is held until the disposition has been sent.
async fn process_delivery(ctx: Arc<DispatchContext>, delivery: Delivery, _permit: SlotPermit) {
    ctx.active.fetch_add(1, Ordering::SeqCst);
    ctx.metrics.handler_started(&ctx.tenant_id);

    let tag = delivery.tag();
    match ctx.handler.handle(&ctx.tenant_id, &delivery).await {
        Ok(()) => match delivery.ack().await {
            Ok(()) => ctx.metrics.message_processed(&ctx.tenant_id),
            Err(err) => {
                tracing::warn!(tenant = %ctx.tenant_id, tag, error = %err, "failed to ack delivery");
            }
        },
        Err(reason) => {
            tracing::warn!(
                tenant = %ctx.tenant_id,
                tag,
                error = %reason,
                "rejecting delivery to dead-letter queue"
            );
            match delivery.reject().await {
                Ok(()) => ctx.metrics.message_rejected(&ctx.tenant_id),
                Err(err) => {
                    tracing::warn!(tenant = %ctx.tenant_id, tag, error = %err, "failed to reject delivery");
                }
            }
        }
    }

    ctx.active.fetch_sub(1, Ordering::SeqCst);
    ctx.metrics.handler_finished(&ctx.tenant_id);
}

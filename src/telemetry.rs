use crate::types::TenantId;

/// Sink for the counters and gauges the relay updates.
///
/// The relay owns no metric state; whoever builds the [`Registry`](crate::Registry)
/// decides where these go.
pub trait RelayMetrics: Send + Sync {
    /// A delivery was persisted and acknowledged.
    fn message_processed(&self, tenant_id: &TenantId);

    /// A delivery was rejected to the dead-letter queue.
    fn message_rejected(&self, tenant_id: &TenantId);

    fn handler_started(&self, tenant_id: &TenantId);

    fn handler_finished(&self, tenant_id: &TenantId);

    /// Latest observed backlog of the tenant's main queue.
    fn queue_depth(&self, tenant_id: &TenantId, depth: u32);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl RelayMetrics for NoopMetrics {
    fn message_processed(&self, _tenant_id: &TenantId) {}

    fn message_rejected(&self, _tenant_id: &TenantId) {}

    fn handler_started(&self, _tenant_id: &TenantId) {}

    fn handler_finished(&self, _tenant_id: &TenantId) {}

    fn queue_depth(&self, _tenant_id: &TenantId, _depth: u32) {}
}

/// Forwards to the `metrics` facade; install any recorder (e.g. a
/// Prometheus exporter) in the composition root.
#[cfg(feature = "metrics")]
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

#[cfg(feature = "metrics")]
impl RelayMetrics for FacadeMetrics {
    fn message_processed(&self, tenant_id: &TenantId) {
        ::metrics::increment_counter!("worker_messages_processed_total", "tenant" => tenant_id.0.clone());
    }

    fn message_rejected(&self, tenant_id: &TenantId) {
        ::metrics::increment_counter!("worker_messages_rejected_total", "tenant" => tenant_id.0.clone());
    }

    fn handler_started(&self, tenant_id: &TenantId) {
        ::metrics::increment_gauge!("worker_active_handlers", 1.0, "tenant" => tenant_id.0.clone());
    }

    fn handler_finished(&self, tenant_id: &TenantId) {
        ::metrics::decrement_gauge!("worker_active_handlers", 1.0, "tenant" => tenant_id.0.clone());
    }

    fn queue_depth(&self, tenant_id: &TenantId, depth: u32) {
        ::metrics::gauge!("queue_depth", depth as f64, "tenant" => tenant_id.0.clone());
    }
}

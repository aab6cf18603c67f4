use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::TenantId;

/// Errors raised by a broker gateway.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The queue was never declared, or has been deleted.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Connection or channel to the broker is gone.
    /// Reconnection is the gateway owner's business, not the relay's.
    #[error("broker connection lost: {0}")]
    Disconnected(String),

    /// The broker refused a published message; it was not enqueued.
    #[error("publish to {0} was not confirmed by the broker")]
    PublishNacked(String),

    #[cfg(feature = "amqp")]
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

/// Errors raised by a persistence gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Message written for a tenant whose storage partition does not exist.
    #[error("no storage partition for tenant {0}")]
    MissingPartition(TenantId),

    #[error("invalid page limit: {0}")]
    InvalidLimit(usize),

    /// Store unreachable or closed.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
}

/// Failure processing a single delivery.
///
/// Local to one delivery: it is resolved by rejecting the delivery to the
/// tenant's dead-letter queue and never escalated.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("failed to persist message: {0}")]
    Persistence(#[from] StoreError),

    #[error("persistence timed out after {0:?}")]
    Timeout(Duration),
}

/// Step of tenant provisioning that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Partition,
    Queue,
    Consumer,
    TenantRecord,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionStep::Partition =>
                write!(f, "storage partition"),
            ProvisionStep::Queue =>
                write!(f, "queue declaration"),
            ProvisionStep::Consumer =>
                write!(f, "consumer start"),
            ProvisionStep::TenantRecord =>
                write!(f, "tenant record"),
        }
    }
}

/// Underlying cause of a provisioning failure.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by [`Registry`](crate::Registry) operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Broker or storage setup failed while adding a tenant.
    /// No pipeline was registered.
    #[error("failed to provision tenant {tenant} ({step}): {source}")]
    Provisioning {
        tenant: TenantId,
        step: ProvisionStep,
        #[source]
        source: ProvisionError,
    },

    /// No live pipeline for this tenant.
    #[error("tenant not found: {0}")]
    NotFound(TenantId),

    #[error("invalid slot count {0}: must be positive")]
    InvalidSlotCount(usize),

    #[error("invalid tenant id: must not be empty")]
    InvalidTenantId,

    /// The pipeline was resized but the new concurrency was not persisted.
    #[error("tenant {tenant} resized but concurrency not persisted: {source}")]
    PersistConcurrency {
        tenant: TenantId,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// `shutdown_all` has run; the registry accepts no new tenants.
    #[error("registry is shut down")]
    ShutDown,
}

impl RegistryError {
    pub(crate) fn provisioning(
        tenant: &TenantId,
        step: ProvisionStep,
        source: impl Into<ProvisionError>,
    ) -> Self {
        RegistryError::Provisioning {
            tenant: tenant.clone(),
            step,
            source: source.into(),
        }
    }
}

/// Errors loading service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

//! Per-tenant consumption pipelines over a shared broker and store.
//!
//! Each tenant gets an isolated pipeline: its own queue, dead-letter queue,
//! storage partition and concurrency level. All tenants share one broker
//! connection and one store.
//!
//! ## Guarantees
//! - At most one pipeline per tenant
//! - Bounded concurrency per tenant, resizable while messages are in flight
//! - A delivery is acknowledged only after it was persisted, and rejected to
//!   the dead-letter queue otherwise
//! - Removing a tenant or shutting down waits for every in-flight delivery
//!
//! ## Non-Guarantees
//! - Exactly-once delivery (the broker contract is at-least-once)
//! - Ordering within a tenant when its concurrency is above one
//! - In-process retries; the dead-letter queue is the retry boundary
//! - Broker or store reconnection

mod broker;
mod broker_memory;
mod config;
mod error;
mod handler;
mod pipeline;
mod registry;
mod slots;
mod storage;
mod telemetry;
mod types;

#[cfg(feature = "amqp")]
mod broker_amqp;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use broker::{
    consumer_tag, dead_letter_queue_name, queue_name, Broker, Delivery, DeliveryStream,
    Disposition, Settle,
};
pub use broker_memory::{InMemoryBroker, QueueStats};
pub use config::{RelayConfig, ServiceConfig};
pub use error::{
    BrokerError, ConfigError, ProcessingError, ProvisionError, ProvisionStep, RegistryError,
    StoreError,
};
pub use handler::{DeliveryHandler, PersistHandler};
pub use pipeline::{Pipeline, PipelineState};
pub use registry::{spawn_depth_sampler, Registry};
pub use storage::{partition_name, InMemoryStore, Store, StoreResult};
pub use telemetry::{NoopMetrics, RelayMetrics};
pub use types::{Message, MessageId, Page, Tenant, TenantId};

#[cfg(feature = "metrics")]
pub use telemetry::FacadeMetrics;

#[cfg(feature = "amqp")]
pub use broker_amqp::AmqpBroker;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;

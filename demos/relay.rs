use std::sync::Arc;

use tenant_relay::{
    spawn_depth_sampler, AmqpBroker, Broker, PostgresStore, Registry, ServiceConfig, Store,
    TenantId,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAY_CONFIG").ok())
        .unwrap_or_else(|| "relay.yaml".to_string());
    let config = ServiceConfig::from_yaml_file(&path)?;

    let (client, connection) =
        tokio_postgres::connect(&config.database_url, tokio_postgres::NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "postgres connection failed");
        }
    });
    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(client).await?);

    let amqp = Arc::new(AmqpBroker::connect(&config.amqp_url, config.relay.prefetch_count).await?);
    let broker: Arc<dyn Broker> = amqp.clone();

    let registry = Arc::new(Registry::new(broker.clone(), store, config.relay.clone()));
    let recovered = registry.recover().await?;
    tracing::info!(recovered, "tenants recovered");

    let tenant = TenantId::new("demo");
    registry.add_tenant(&tenant).await?;
    broker.publish(&tenant, br#"{"hello":"world"}"#).await?;

    let sampler_shutdown = CancellationToken::new();
    let sampler = spawn_depth_sampler(
        registry.clone(),
        config.relay.depth_sample_interval(),
        sampler_shutdown.clone(),
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    sampler_shutdown.cancel();
    let _ = sampler.await;

    if tokio::time::timeout(config.relay.shutdown_grace(), registry.shutdown_all())
        .await
        .is_err()
    {
        tracing::warn!("shutdown grace period elapsed with deliveries still in flight");
    }
    amqp.close().await?;
    Ok(())
}

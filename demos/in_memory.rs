use std::sync::Arc;

use tenant_relay::{Broker, InMemoryBroker, InMemoryStore, Registry, RelayConfig, Store, TenantId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenant_relay=debug".into()),
        )
        .init();

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStore::new());
    let registry = Registry::new(
        broker.clone() as Arc<dyn Broker>,
        store.clone() as Arc<dyn Store>,
        RelayConfig::default(),
    );

    let tenant = TenantId::new("tenant_a");
    registry.add_tenant(&tenant).await?;

    for i in 0..10 {
        broker
            .publish(&tenant, format!(r#"{{"order":{i}}}"#).as_bytes())
            .await?;
    }
    broker.publish(&tenant, b"not json").await?;

    registry.set_worker_count(&tenant, 2).await?;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    registry.shutdown_all().await;

    let mut cursor = None;
    loop {
        let page = store.list_messages(&tenant, cursor, 4).await?;
        for message in &page.messages {
            println!("{} {}", message.id, String::from_utf8_lossy(&message.payload));
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    println!("dead-lettered: {}", broker.dead_letters(&tenant).len());
    Ok(())
}

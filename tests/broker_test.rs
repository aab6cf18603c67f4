use tenant_relay::{
    consumer_tag, dead_letter_queue_name, queue_name, Broker, BrokerError, InMemoryBroker,
    QueueStats, TenantId,
};

#[tokio::test]
async fn test_queue_names() {
    let tenant = TenantId::new("acme");
    assert_eq!(queue_name(&tenant), "tenant_acme_queue");
    assert_eq!(dead_letter_queue_name(&tenant), "tenant_acme_dlq");
    assert_eq!(consumer_tag(&tenant), "consumer-acme");
}

#[tokio::test]
async fn test_ack_and_reject_dispositions() {
    let broker = InMemoryBroker::new();
    let tenant = TenantId::new("acme");
    broker.declare_queue(&tenant).await.unwrap();
    broker.publish(&tenant, b"first").await.unwrap();
    broker.publish(&tenant, b"second").await.unwrap();

    let mut stream = broker.consume(&tenant).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(first.payload(), b"first");
    assert!(first.timestamp().is_some());
    assert_ne!(first.tag(), second.tag());

    first.ack().await.unwrap();
    second.reject().await.unwrap();

    assert_eq!(
        broker.stats(&tenant),
        Some(QueueStats {
            ready: 0,
            unacked: 0,
            acked: 1
        })
    );
    assert_eq!(broker.dead_letters(&tenant), vec![b"second".to_vec()]);
}

#[tokio::test]
async fn test_dropped_delivery_is_requeued() {
    let broker = InMemoryBroker::new();
    let tenant = TenantId::new("acme");
    broker.declare_queue(&tenant).await.unwrap();
    broker.publish(&tenant, b"one").await.unwrap();
    broker.publish(&tenant, b"two").await.unwrap();

    let mut stream = broker.consume(&tenant).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(broker.stats(&tenant).unwrap().unacked, 1);
    drop(delivery);

    let stats = broker.stats(&tenant).unwrap();
    assert_eq!(stats.ready, 2);
    assert_eq!(stats.unacked, 0);

    // Requeued at the head.
    let redelivered = stream.next().await.unwrap().unwrap();
    assert_eq!(redelivered.payload(), b"one");
    redelivered.ack().await.unwrap();
}

#[tokio::test]
async fn test_declare_is_idempotent() {
    let broker = InMemoryBroker::new();
    let tenant = TenantId::new("acme");
    broker.declare_queue(&tenant).await.unwrap();
    broker.publish(&tenant, b"kept").await.unwrap();
    broker.declare_queue(&tenant).await.unwrap();

    assert_eq!(broker.inspect_depth(&tenant).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_queue_errors() {
    let broker = InMemoryBroker::new();
    let tenant = TenantId::new("ghost");

    assert!(matches!(
        broker.publish(&tenant, b"x").await,
        Err(BrokerError::QueueNotFound(name)) if name == "tenant_ghost_queue"
    ));
    assert!(broker.consume(&tenant).await.is_err());
    assert!(broker.inspect_depth(&tenant).await.is_err());
    assert!(broker.delete_queue(&tenant).await.is_err());
}

#[tokio::test]
async fn test_delete_ends_stream_and_keeps_dead_letters() {
    let broker = InMemoryBroker::new();
    let tenant = TenantId::new("acme");
    broker.declare_queue(&tenant).await.unwrap();
    broker.publish(&tenant, b"bad").await.unwrap();

    let mut stream = broker.consume(&tenant).await.unwrap();
    stream.next().await.unwrap().unwrap().reject().await.unwrap();

    let waiting = tokio::spawn(async move { stream.next().await.is_none() });
    broker.delete_queue(&tenant).await.unwrap();
    assert!(waiting.await.unwrap());

    assert!(broker.stats(&tenant).is_none());
    assert_eq!(broker.dead_letters(&tenant), vec![b"bad".to_vec()]);
}

#[tokio::test]
async fn test_cancelled_stream_yields_nothing() {
    let broker = InMemoryBroker::new();
    let tenant = TenantId::new("acme");
    broker.declare_queue(&tenant).await.unwrap();
    broker.publish(&tenant, b"pending").await.unwrap();

    let mut stream = broker.consume(&tenant).await.unwrap();
    stream.cancel().await.unwrap();
    assert!(stream.next().await.is_none());
    stream.close().await.unwrap();

    assert_eq!(broker.inspect_depth(&tenant).await.unwrap(), 1);
}

#[tokio::test]
async fn test_inspect_depth_counts_ready_only() {
    let broker = InMemoryBroker::new();
    let tenant = TenantId::new("acme");
    broker.declare_queue(&tenant).await.unwrap();
    for _ in 0..3 {
        broker.publish(&tenant, b"{}").await.unwrap();
    }

    let mut stream = broker.consume(&tenant).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(broker.inspect_depth(&tenant).await.unwrap(), 2);
    delivery.ack().await.unwrap();
    assert_eq!(broker.inspect_depth(&tenant).await.unwrap(), 2);
}

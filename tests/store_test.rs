use chrono::Utc;
use tenant_relay::{
    partition_name, InMemoryStore, Message, MessageId, Store, StoreError, Tenant, TenantId,
};

async fn seeded(tenant: &TenantId, count: usize) -> (InMemoryStore, Vec<MessageId>) {
    let store = InMemoryStore::new();
    store.ensure_partition(tenant).await.unwrap();

    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let message = Message::new(tenant.clone(), format!(r#"{{"n":{i}}}"#), Utc::now());
        ids.push(message.id);
        store.insert_message(&message).await.unwrap();
    }
    ids.sort();
    (store, ids)
}

#[tokio::test]
async fn test_pagination_walks_all_pages() {
    let tenant = TenantId::new("acme");
    let (store, ids) = seeded(&tenant, 25).await;

    let first = store.list_messages(&tenant, None, 10).await.unwrap();
    assert_eq!(first.messages.len(), 10);
    assert_eq!(first.next_cursor, Some(ids[9]));

    let second = store
        .list_messages(&tenant, first.next_cursor, 10)
        .await
        .unwrap();
    assert_eq!(second.messages.len(), 10);
    assert_eq!(second.messages[0].id, ids[10]);
    assert_eq!(second.next_cursor, Some(ids[19]));

    let third = store
        .list_messages(&tenant, second.next_cursor, 10)
        .await
        .unwrap();
    assert_eq!(third.messages.len(), 5);
    assert_eq!(third.next_cursor, None);

    let walked: Vec<MessageId> = first
        .messages
        .iter()
        .chain(&second.messages)
        .chain(&third.messages)
        .map(|m| m.id)
        .collect();
    assert_eq!(walked, ids);
}

#[tokio::test]
async fn test_exact_multiple_ends_with_empty_page() {
    let tenant = TenantId::new("acme");
    let (store, ids) = seeded(&tenant, 20).await;

    let second = store
        .list_messages(&tenant, Some(ids[9]), 10)
        .await
        .unwrap();
    assert_eq!(second.next_cursor, Some(ids[19]));

    let last = store
        .list_messages(&tenant, second.next_cursor, 10)
        .await
        .unwrap();
    assert!(last.messages.is_empty());
    assert_eq!(last.next_cursor, None);
}

#[tokio::test]
async fn test_zero_limit_is_rejected() {
    let tenant = TenantId::new("acme");
    let (store, _) = seeded(&tenant, 1).await;

    let result = store.list_messages(&tenant, None, 0).await;
    assert!(matches!(result, Err(StoreError::InvalidLimit(0))));
}

#[tokio::test]
async fn test_insert_is_idempotent_per_id() {
    let tenant = TenantId::new("acme");
    let store = InMemoryStore::new();
    store.ensure_partition(&tenant).await.unwrap();
    store.ensure_partition(&tenant).await.unwrap();

    let message = Message::new(tenant.clone(), b"{}".to_vec(), Utc::now());
    store.insert_message(&message).await.unwrap();
    store.insert_message(&message).await.unwrap();

    assert_eq!(store.message_count(&tenant).await, 1);
}

#[tokio::test]
async fn test_insert_without_partition_fails() {
    let tenant = TenantId::new("unprovisioned");
    let store = InMemoryStore::new();

    let message = Message::new(tenant.clone(), b"{}".to_vec(), Utc::now());
    let result = store.insert_message(&message).await;
    assert!(matches!(result, Err(StoreError::MissingPartition(id)) if id == tenant));

    let page = store.list_messages(&tenant, None, 10).await.unwrap();
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn test_partitions_are_isolated() {
    let acme = TenantId::new("acme");
    let globex = TenantId::new("globex");
    let (store, _) = seeded(&acme, 3).await;
    store.ensure_partition(&globex).await.unwrap();

    let page = store.list_messages(&globex, None, 10).await.unwrap();
    assert!(page.messages.is_empty());
    assert_eq!(store.message_count(&acme).await, 3);
}

#[tokio::test]
async fn test_tenant_records() {
    let store = InMemoryStore::new();
    let acme = Tenant::new(TenantId::new("acme"), 3);
    let globex = Tenant::new(TenantId::new("globex"), 5);

    store.create_tenant(&acme).await.unwrap();
    store.create_tenant(&globex).await.unwrap();
    // An existing record is left as is.
    store
        .create_tenant(&Tenant::new(TenantId::new("acme"), 9))
        .await
        .unwrap();
    assert_eq!(store.tenant(&acme.id).await.unwrap().concurrency, 3);

    store.update_concurrency(&acme.id, 6).await.unwrap();
    assert_eq!(store.tenant(&acme.id).await.unwrap().concurrency, 6);

    let ids: Vec<TenantId> = store
        .list_tenants()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&acme.id) && ids.contains(&globex.id));

    store.delete_tenant(&acme.id).await.unwrap();
    assert!(store.tenant(&acme.id).await.is_none());
    // Updating a missing record is not an error.
    store.update_concurrency(&acme.id, 2).await.unwrap();
    assert_eq!(store.list_tenants().await.unwrap().len(), 1);
}

#[test]
fn test_partition_names_are_distinct_per_tenant() {
    let long_prefix = "x".repeat(80);
    let ids = [
        "acme".to_string(),
        "Acme".to_string(),
        "a-cme".to_string(),
        "a_cme".to_string(),
        "a cme".to_string(),
        format!("{long_prefix}-one"),
        format!("{long_prefix}-two"),
    ];

    let names: Vec<String> = ids
        .iter()
        .map(|id| partition_name(&TenantId::new(id.as_str())))
        .collect();

    for (i, name) in names.iter().enumerate() {
        assert!(name.len() <= 63, "{name} exceeds the identifier limit");
        assert!(name.starts_with("messages_"));
        for other in &names[i + 1..] {
            assert_ne!(name, other);
        }
    }
    // Stable across calls, so an existing partition is found again.
    assert_eq!(names[0], partition_name(&TenantId::new("acme")));
}

#[tokio::test]
async fn test_case_variants_get_separate_partitions() {
    let lower = TenantId::new("acme");
    let upper = TenantId::new("Acme");
    let store = InMemoryStore::new();
    store.ensure_partition(&lower).await.unwrap();
    store.ensure_partition(&upper).await.unwrap();

    store
        .insert_message(&Message::new(upper.clone(), b"{}".to_vec(), Utc::now()))
        .await
        .unwrap();

    assert_eq!(store.message_count(&upper).await, 1);
    assert_eq!(store.message_count(&lower).await, 0);
}

//! Fan-out tests for the dispatcher.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use anyhow::Result;
use courier_core::{
    DeliveryStatus, Endpoint, EndpointStatus, FilterCondition, FilterConditions, SourceRef,
    TenantId, TestClock,
};
use courier_delivery::{
    seed_catalog, storage::mock::MockDeliveryStorage, DeliveryStorage, DispatchOutcome, Dispatcher,
};
use serde_json::json;

async fn setup() -> (Arc<MockDeliveryStorage>, Dispatcher, TenantId) {
    let storage = Arc::new(MockDeliveryStorage::new());
    seed_catalog(storage.as_ref()).await.unwrap();
    let dispatcher = Dispatcher::new(storage.clone(), Arc::new(TestClock::new()));
    (storage, dispatcher, TenantId::new())
}

async fn register(
    storage: &MockDeliveryStorage,
    tenant_id: TenantId,
    name: &str,
    events: &[&str],
) -> Endpoint {
    let endpoint = Endpoint::new(
        tenant_id,
        name,
        format!("https://{name}.example.com/hook"),
        "whsec_dispatch",
        chrono::Utc::now(),
    )
    .subscribed_to(events.iter().copied());
    storage.create_endpoint(endpoint.clone()).await.unwrap();
    endpoint
}

#[tokio::test]
async fn fans_out_one_delivery_per_matching_endpoint() -> Result<()> {
    let (storage, dispatcher, tenant) = setup().await;
    for name in ["a", "b", "c"] {
        register(&storage, tenant, name, &["transaction.completed"]).await;
    }
    register(&storage, tenant, "other-type", &["user.created"]).await;
    register(&storage, TenantId::new(), "other-tenant", &["transaction.completed"]).await;

    let source = SourceRef::new("transaction", "tx-991");
    let event_id = dispatcher
        .dispatch_event("transaction.completed", json!({"amount": 10}), tenant, Some(source.clone()))
        .await;

    let deliveries = storage.find_deliveries_by_event(event_id).await?;
    assert_eq!(deliveries.len(), 3);
    for delivery in &deliveries {
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt_number, 1);
        assert_eq!(delivery.max_attempts, 4);
        assert_eq!(delivery.event_id, event_id);
        assert!(delivery.next_retry_at.is_some());
    }

    let log = storage.find_event_log(event_id).await?.unwrap();
    assert_eq!(log.endpoints_notified, 3);
    assert!(log.is_processed);
    assert_eq!(log.source, Some(source));
    Ok(())
}

#[tokio::test]
async fn unknown_and_inactive_types_are_silent_no_ops() -> Result<()> {
    let (storage, dispatcher, tenant) = setup().await;
    register(&storage, tenant, "maint", &["system.maintenance"]).await;
    storage.set_event_definition_active("system.maintenance".into(), false).await?;

    let unknown = dispatcher.dispatch_event("nope.never", json!({}), tenant, None).await;
    let inactive = dispatcher.dispatch_event("system.maintenance", json!({}), tenant, None).await;

    assert_ne!(unknown, inactive);
    assert!(storage.event_logs().await.is_empty());
    assert!(storage.deliveries().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn no_subscribers_still_records_the_occurrence() -> Result<()> {
    let (storage, dispatcher, tenant) = setup().await;

    let outcome = dispatcher
        .try_dispatch(courier_core::EventId::new(), "user.deleted", json!({}), tenant, None)
        .await?;

    assert_eq!(outcome, DispatchOutcome::Dispatched { deliveries: vec![] });
    let logs = storage.event_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].endpoints_notified, 0);
    assert_eq!(logs[0].success_rate(), None);
    Ok(())
}

#[tokio::test]
async fn non_active_endpoints_are_skipped() -> Result<()> {
    let (storage, dispatcher, tenant) = setup().await;
    let live = register(&storage, tenant, "live", &["user.created"]).await;
    for (name, status) in
        [("paused", EndpointStatus::Inactive), ("tripped", EndpointStatus::Suspended)]
    {
        let mut endpoint = register(&storage, tenant, name, &["user.created"]).await;
        endpoint.status = status;
        storage.put_endpoint(endpoint).await;
    }

    let event_id = dispatcher.dispatch_event("user.created", json!({}), tenant, None).await;

    let deliveries = storage.find_deliveries_by_event(event_id).await?;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].endpoint_id, live.id);
    Ok(())
}

#[tokio::test]
async fn filter_selects_on_payload_and_ignores_absent_fields() -> Result<()> {
    let (storage, dispatcher, tenant) = setup().await;
    let mut critical = register(&storage, tenant, "critical-only", &["system.maintenance"]).await;
    critical.filter_conditions.0 =
        FilterConditions::new().with("status", FilterCondition::equals("critical"));
    storage.put_endpoint(critical.clone()).await;

    let matching = dispatcher
        .dispatch_event("system.maintenance", json!({"status": "critical"}), tenant, None)
        .await;
    let other = dispatcher
        .dispatch_event("system.maintenance", json!({"status": "minor"}), tenant, None)
        .await;
    let absent = dispatcher.dispatch_event("system.maintenance", json!({}), tenant, None).await;

    assert_eq!(storage.find_deliveries_by_event(matching).await?.len(), 1);
    assert_eq!(storage.find_deliveries_by_event(other).await?.len(), 0);
    assert_eq!(storage.find_deliveries_by_event(absent).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn low_stock_reaches_only_the_unfiltered_endpoint() -> Result<()> {
    let (storage, dispatcher, tenant) = setup().await;
    let plain = register(&storage, tenant, "warehouse", &["inventory.low_stock"]).await;
    let mut picky = register(&storage, tenant, "bulk-only", &["inventory.low_stock"]).await;
    picky.filter_conditions.0 = FilterConditions::new().with("quantity", FilterCondition::equals(10));
    storage.put_endpoint(picky).await;

    let event_id = dispatcher
        .dispatch_event(
            "inventory.low_stock",
            json!({"item_code": "X1", "quantity": 2}),
            tenant,
            None,
        )
        .await;

    let deliveries = storage.find_deliveries_by_event(event_id).await?;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].endpoint_id, plain.id);
    assert_eq!(storage.find_event_log(event_id).await?.unwrap().endpoints_notified, 1);
    Ok(())
}

#[tokio::test]
async fn storage_failure_is_swallowed_and_leaves_nothing_behind() -> Result<()> {
    let (storage, dispatcher, tenant) = setup().await;
    register(&storage, tenant, "a", &["payment.failed"]).await;
    storage.inject_dispatch_error("connection reset").await;

    let event_id = dispatcher.dispatch_event("payment.failed", json!({}), tenant, None).await;

    assert!(storage.find_event_log(event_id).await?.is_none());
    assert!(storage.deliveries().await.is_empty());

    // The injected failure is one-shot.
    let retried = dispatcher.dispatch_event("payment.failed", json!({}), tenant, None).await;
    assert_eq!(storage.find_deliveries_by_event(retried).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn direct_delivery_ignores_subscriptions() -> Result<()> {
    let (storage, dispatcher, tenant) = setup().await;
    let endpoint = register(&storage, tenant, "unsubscribed", &[]).await;

    let delivery = dispatcher
        .dispatch_to_endpoint(&endpoint, "system.test", json!({"message": "ping"}))
        .await?;

    assert_eq!(delivery.endpoint_id, endpoint.id);
    let log = storage.find_event_log(delivery.event_id).await?.unwrap();
    assert_eq!(log.event_type, "system.test");
    assert_eq!(log.endpoints_notified, 1);

    // Stored already claimed, so no worker can pick it up.
    let stored = storage.find_delivery(delivery.id).await?.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Sending);
    assert_eq!(stored.sent_at, Some(delivery.created_at));
    let later = delivery.created_at + chrono::Duration::hours(1);
    assert!(storage.find_due_pending(later, 100).await?.is_empty());
    Ok(())
}

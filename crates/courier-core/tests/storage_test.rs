//! Integration tests for the PostgreSQL repositories.
//!
//! Require `DATABASE_URL`; each test is skipped when it is unset. Every test
//! works in a fresh tenant so they can share one database.

use chrono::{Duration, Utc};
use courier_core::{
    storage::{schema, Storage},
    Delivery, DeliveryOutcome, DeliveryQuery, DeliveryStatus, Endpoint, EndpointStatus,
    EventCategory, EventDefinition, EventId, EventLog, EventLogQuery, FilterCondition,
    FilterConditions, SourceRef, TenantId,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

static MIGRATED: tokio::sync::Mutex<bool> = tokio::sync::Mutex::const_new(false);

async fn storage() -> Option<Storage> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.unwrap();

    let mut migrated = MIGRATED.lock().await;
    if !*migrated {
        schema::migrate(&pool).await.unwrap();
        *migrated = true;
    }
    drop(migrated);

    let storage = Storage::new(pool);
    for definition in [
        EventDefinition::new("user.created", "User created", EventCategory::User).unwrap(),
        EventDefinition::new("inventory.low_stock", "Low stock", EventCategory::Inventory)
            .unwrap(),
    ] {
        storage.event_definitions.upsert(&definition).await.unwrap();
    }
    Some(storage)
}

fn endpoint(tenant_id: TenantId, name: &str) -> Endpoint {
    Endpoint::new(tenant_id, name, "https://example.com/hook", "whsec_test", Utc::now())
        .subscribed_to(["user.created"])
}

async fn dispatched(storage: &Storage, endpoint: &Endpoint) -> Delivery {
    let now = Utc::now();
    let log = EventLog::new(
        EventId::new(),
        endpoint.tenant_id,
        "user.created",
        json!({"user_id": 7}),
        Some(SourceRef::new("user", "7")),
        now,
    );
    let delivery = Delivery::new(endpoint, &log, now);
    storage.record_dispatch(&log, std::slice::from_ref(&delivery), now).await.unwrap();
    delivery
}

#[tokio::test]
async fn health_check_succeeds() {
    let Some(storage) = storage().await else { return };
    storage.health_check().await.unwrap();
}

#[tokio::test]
async fn endpoint_round_trips_with_subscriptions_and_filter() {
    let Some(storage) = storage().await else { return };
    let tenant = TenantId::new();
    let ep = endpoint(tenant, "orders")
        .subscribed_to(["user.created", "inventory.low_stock"])
        .with_filter(FilterConditions::new().with("quantity", FilterCondition::equals(10)));

    storage.endpoints.create(&ep).await.unwrap();
    let found = storage.endpoints.find_by_id(ep.id).await.unwrap().unwrap();

    assert_eq!(found.name, "orders");
    assert_eq!(found.secret, "whsec_test");
    assert_eq!(found.subscribed_events, vec!["inventory.low_stock", "user.created"]);
    assert_eq!(found.filter_conditions.0, ep.filter_conditions.0);
    assert_eq!(found.status, EndpointStatus::Active);
    assert!(storage.endpoints.find_by_name(tenant, "orders").await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_name_within_tenant_is_rejected() {
    let Some(storage) = storage().await else { return };
    let tenant = TenantId::new();
    storage.endpoints.create(&endpoint(tenant, "dup")).await.unwrap();

    let err = storage.endpoints.create(&endpoint(tenant, "dup")).await.unwrap_err();
    assert!(matches!(err, courier_core::CoreError::ConstraintViolation(_)));

    storage.endpoints.create(&endpoint(TenantId::new(), "dup")).await.unwrap();
}

#[tokio::test]
async fn dispatch_targets_exclude_unsubscribed_and_inactive() {
    let Some(storage) = storage().await else { return };
    let tenant = TenantId::new();
    let subscribed = endpoint(tenant, "a");
    let other = endpoint(tenant, "b").subscribed_to(["inventory.low_stock"]);
    let mut inactive = endpoint(tenant, "c");
    inactive.status = EndpointStatus::Inactive;
    for ep in [&subscribed, &other, &inactive] {
        storage.endpoints.create(ep).await.unwrap();
    }

    let targets = storage.endpoints.find_dispatch_targets(tenant, "user.created").await.unwrap();

    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].id, subscribed.id);
}

#[tokio::test]
async fn breaker_trips_at_threshold_and_success_resets() {
    let Some(storage) = storage().await else { return };
    let mut ep = endpoint(TenantId::new(), "flaky");
    ep.failure_threshold = 3;
    storage.endpoints.create(&ep).await.unwrap();
    let now = Utc::now();
    let until = now + Duration::minutes(60);

    for expected in 1..3 {
        let health =
            storage.endpoints.record_failure(ep.id, now, Some(until)).await.unwrap().unwrap();
        assert_eq!(health.consecutive_failures, expected);
        assert_eq!(health.status, EndpointStatus::Active);
    }
    let tripped = storage.endpoints.record_failure(ep.id, now, Some(until)).await.unwrap().unwrap();
    assert_eq!(tripped.status, EndpointStatus::Suspended);
    assert_eq!(tripped.suspended_until.map(|t| t.timestamp()), Some(until.timestamp()));

    let short_circuited = storage.endpoints.record_failure(ep.id, now, None).await.unwrap().unwrap();
    assert_eq!(short_circuited.consecutive_failures, 4);
    assert_eq!(short_circuited.suspended_until.map(|t| t.timestamp()), Some(until.timestamp()));

    let healed = storage.endpoints.record_success(ep.id, now).await.unwrap().unwrap();
    assert_eq!(healed.status, EndpointStatus::Active);
    assert_eq!(healed.consecutive_failures, 0);
    assert_eq!(healed.suspended_until, None);

    let stored = storage.endpoints.find_by_id(ep.id).await.unwrap().unwrap();
    assert_eq!(stored.total_deliveries, 5);
    assert_eq!(stored.failed_deliveries, 4);
    assert_eq!(stored.successful_deliveries, 1);
}

#[tokio::test]
async fn record_dispatch_writes_log_and_deliveries() {
    let Some(storage) = storage().await else { return };
    let ep = endpoint(TenantId::new(), "audit");
    storage.endpoints.create(&ep).await.unwrap();

    let delivery = dispatched(&storage, &ep).await;

    let log = storage.event_logs.find_by_id(delivery.event_id).await.unwrap().unwrap();
    assert!(log.is_processed);
    assert_eq!(log.endpoints_notified, 1);
    assert_eq!(log.source, Some(SourceRef::new("user", "7")));

    let listed = storage.event_logs.list_by_tenant(ep.tenant_id, &EventLogQuery::default()).await;
    assert_eq!(listed.unwrap().len(), 1);
    let by_event = storage.deliveries.find_by_event(delivery.event_id).await.unwrap();
    assert_eq!(by_event.len(), 1);
    assert_eq!(by_event[0].max_attempts, 4);
}

#[tokio::test]
async fn claim_is_exclusive() {
    let Some(storage) = storage().await else { return };
    let ep = endpoint(TenantId::new(), "claims");
    storage.endpoints.create(&ep).await.unwrap();
    let delivery = dispatched(&storage, &ep).await;

    let (first, second) = tokio::join!(
        storage.deliveries.claim(delivery.id, Utc::now()),
        storage.deliveries.claim(delivery.id, Utc::now()),
    );

    let claimed = [first.unwrap(), second.unwrap()].into_iter().flatten().count();
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn failed_delivery_requeues_as_next_attempt() {
    let Some(storage) = storage().await else { return };
    let ep = endpoint(TenantId::new(), "retries");
    storage.endpoints.create(&ep).await.unwrap();
    let delivery = dispatched(&storage, &ep).await;
    let now = Utc::now();

    storage.deliveries.claim(delivery.id, now).await.unwrap().unwrap();
    let outcome = DeliveryOutcome::rejected(DeliveryStatus::Failed, "HTTP_503", "unavailable", now)
        .retry_at(Some(now - Duration::seconds(1)));
    assert!(storage.deliveries.complete(delivery.id, &outcome).await.unwrap());

    let due = storage.deliveries.find_due_failed(now, 100).await.unwrap();
    assert!(due.contains(&delivery.id));

    let requeued = storage.deliveries.requeue(delivery.id, now).await.unwrap().unwrap();
    assert_eq!(requeued.status, DeliveryStatus::Pending);
    assert_eq!(requeued.attempt_number, 2);
    assert_eq!(requeued.error_code, None);

    let listed = storage
        .deliveries
        .list(&DeliveryQuery { endpoint_id: Some(ep.id), ..DeliveryQuery::default() })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn delete_cascades_to_deliveries() {
    let Some(storage) = storage().await else { return };
    let ep = endpoint(TenantId::new(), "gone");
    storage.endpoints.create(&ep).await.unwrap();
    let delivery = dispatched(&storage, &ep).await;

    assert!(storage.endpoints.delete(ep.id).await.unwrap());
    assert!(!storage.endpoints.delete(ep.id).await.unwrap());
    assert!(storage.deliveries.find_by_id(delivery.id).await.unwrap().is_none());
}

#[tokio::test]
async fn running_suspension_is_not_extended_by_late_failures() {
    let Some(storage) = storage().await else { return };
    let mut ep = endpoint(TenantId::new(), "late-failures");
    ep.failure_threshold = 1;
    storage.endpoints.create(&ep).await.unwrap();
    let now = Utc::now();
    let until = now + Duration::minutes(60);

    let tripped = storage.endpoints.record_failure(ep.id, now, Some(until)).await.unwrap().unwrap();
    assert_eq!(tripped.suspended_until.map(|t| t.timestamp()), Some(until.timestamp()));

    // An attempt admitted before the trip fails while the suspension runs.
    let later = now + Duration::minutes(1);
    let health = storage
        .endpoints
        .record_failure(ep.id, later, Some(later + Duration::minutes(60)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.status, EndpointStatus::Suspended);
    assert_eq!(health.suspended_until.map(|t| t.timestamp()), Some(until.timestamp()));

    // A failed trial after the cooldown suspends again.
    let trial = until + Duration::seconds(1);
    let again = trial + Duration::minutes(60);
    let health =
        storage.endpoints.record_failure(ep.id, trial, Some(again)).await.unwrap().unwrap();
    assert_eq!(health.suspended_until.map(|t| t.timestamp()), Some(again.timestamp()));
}

#[tokio::test]
async fn abandoned_claim_is_failed_and_due_for_retry() {
    let Some(storage) = storage().await else { return };
    let ep = endpoint(TenantId::new(), "abandoned");
    storage.endpoints.create(&ep).await.unwrap();
    let abandoned = dispatched(&storage, &ep).await;
    let in_flight = dispatched(&storage, &ep).await;
    let now = Utc::now();

    storage.deliveries.claim(abandoned.id, now - Duration::hours(2)).await.unwrap().unwrap();
    storage.deliveries.claim(in_flight.id, now).await.unwrap().unwrap();

    let outcome =
        DeliveryOutcome::rejected(DeliveryStatus::Failed, "UNEXPECTED_ERROR", "abandoned", now);
    let released = storage.deliveries.fail_stale_claims(&outcome, 60, 100).await.unwrap();
    let released: Vec<_> = released.into_iter().filter(|d| d.endpoint_id == ep.id).collect();

    assert_eq!(released.len(), 1);
    assert_eq!(released[0].id, abandoned.id);
    assert_eq!(released[0].status, DeliveryStatus::Failed);
    assert_eq!(released[0].attempt_number, 1);
    assert_eq!(released[0].error_code.as_deref(), Some("UNEXPECTED_ERROR"));
    assert_eq!(released[0].next_retry_at.map(|t| t.timestamp()), Some(now.timestamp()));

    // Already released; the sweep does not touch it twice.
    let again = storage.deliveries.fail_stale_claims(&outcome, 60, 100).await.unwrap();
    assert!(again.iter().all(|d| d.id != abandoned.id));

    let still_sending = storage.deliveries.find_by_id(in_flight.id).await.unwrap().unwrap();
    assert_eq!(still_sending.status, DeliveryStatus::Sending);
}

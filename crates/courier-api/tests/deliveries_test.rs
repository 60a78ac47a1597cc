//! Publishing, delivery inspection, manual retry and catalog API tests.

mod common;

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use common::TestApp;
use courier_core::{Clock, Delivery, DeliveryStatus, Endpoint, EventId, EventLog, TenantId};
use serde_json::{json, Value};
use uuid::Uuid;

async fn subscribed(app: &TestApp, tenant: Uuid, name: &str, events: &[&str]) -> Value {
    app.create_endpoint(
        tenant,
        json!({"name": name, "url": format!("https://{name}.example.com"), "subscribed_events": events}),
    )
    .await
}

async fn failed_delivery(app: &TestApp, attempt_number: i32) -> Delivery {
    let now = app.clock.now_utc();
    let endpoint = Endpoint::new(TenantId::new(), "retry", "https://r.example.com", "whsec_r", now);
    let log = EventLog::new(EventId::new(), endpoint.tenant_id, "user.created", json!({}), None, now);
    let mut delivery = Delivery::new(&endpoint, &log, now);
    delivery.status = DeliveryStatus::Failed;
    delivery.attempt_number = attempt_number;
    delivery.next_retry_at = Some(now + Duration::minutes(10));
    delivery.error_code = Some("HTTP_502".to_string());
    app.storage.put_delivery(delivery.clone()).await;
    delivery
}

#[tokio::test]
async fn publish_fans_out_and_is_visible_in_event_log() {
    let app = TestApp::new().await;
    let tenant = Uuid::new_v4();
    subscribed(&app, tenant, "a", &["transaction.completed"]).await;
    subscribed(&app, tenant, "b", &["transaction.completed"]).await;
    subscribed(&app, tenant, "c", &["user.created"]).await;

    let (status, published) = app
        .post(
            &format!("/v1/tenants/{tenant}/events"),
            json!({
                "event_type": "transaction.completed",
                "payload": {"amount": 4200},
                "source": {"kind": "transaction", "id": "tx-7"},
            }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let event_id = published["event_id"].as_str().unwrap();

    let (status, deliveries) = app.get(&format!("/v1/deliveries?event_id={event_id}")).await;
    assert_eq!(status, StatusCode::OK);
    let deliveries = deliveries.as_array().unwrap();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d["status"] == "pending" && d["attempt_number"] == 1));

    let (status, detail) = app.get(&format!("/v1/event-logs/{event_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["endpoints_notified"], 2);
    assert_eq!(detail["success_rate"], 0.0);
    assert_eq!(detail["source"], json!({"kind": "transaction", "id": "tx-7"}));
    assert_eq!(detail["deliveries"].as_array().unwrap().len(), 2);

    let (_, logs) = app.get(&format!("/v1/tenants/{tenant}/event-logs")).await;
    assert_eq!(logs.as_array().unwrap().len(), 1);
    let (_, filtered) =
        app.get(&format!("/v1/tenants/{tenant}/event-logs?event_type=user.created")).await;
    assert!(filtered.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_event_type_is_accepted_but_not_recorded() {
    let app = TestApp::new().await;
    let tenant = Uuid::new_v4();

    let (status, published) = app
        .post(&format!("/v1/tenants/{tenant}/events"), json!({"event_type": "made.up"}))
        .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let event_id = published["event_id"].as_str().unwrap();
    let (status, _) = app.get(&format!("/v1/event-logs/{event_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(app.storage.event_logs().await.is_empty());
}

#[tokio::test]
async fn event_with_no_subscribers_has_null_success_rate() {
    let app = TestApp::new().await;
    let tenant = Uuid::new_v4();

    let (_, published) = app
        .post(&format!("/v1/tenants/{tenant}/events"), json!({"event_type": "user.deleted"}))
        .await;

    let (status, detail) =
        app.get(&format!("/v1/event-logs/{}", published["event_id"].as_str().unwrap())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["endpoints_notified"], 0);
    assert_eq!(detail["success_rate"], Value::Null);
}

#[tokio::test]
async fn deliveries_filter_by_status_and_endpoint() {
    let app = TestApp::new().await;
    let tenant = Uuid::new_v4();
    let endpoint = subscribed(&app, tenant, "orders", &["user.created"]).await;
    app.post(&format!("/v1/tenants/{tenant}/events"), json!({"event_type": "user.created"}))
        .await;
    let failed = failed_delivery(&app, 1).await;

    let (_, pending) = app.get("/v1/deliveries?status=pending").await;
    assert_eq!(pending.as_array().unwrap().len(), 1);

    let (_, by_status) = app.get("/v1/deliveries?status=failed").await;
    assert_eq!(by_status.as_array().unwrap().len(), 1);
    assert_eq!(by_status[0]["id"], failed.id.to_string());

    let (_, by_endpoint) =
        app.get(&format!("/v1/deliveries?endpoint_id={}", endpoint["id"].as_str().unwrap())).await;
    assert_eq!(by_endpoint.as_array().unwrap().len(), 1);

    let (_, page) = app.get("/v1/deliveries?limit=1&offset=1").await;
    assert_eq!(page.as_array().unwrap().len(), 1);

    let (status, one) = app.get(&format!("/v1/deliveries/{}", failed.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["error_code"], "HTTP_502");
    assert_eq!(app.get(&format!("/v1/deliveries/{}", Uuid::new_v4())).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_makes_eligible_delivery_due_now() {
    let app = TestApp::new().await;
    let delivery = failed_delivery(&app, 2).await;

    let (status, retried) = app.post(&format!("/v1/deliveries/{}/retry", delivery.id), json!({})).await;

    assert_eq!(status, StatusCode::ACCEPTED, "{retried}");
    let due: DateTime<Utc> = retried["next_retry_at"].as_str().unwrap().parse().unwrap();
    assert_eq!(due, app.clock.now_utc());
    assert_eq!(retried["status"], "failed");
    assert_eq!(retried["attempt_number"], 2);
}

#[tokio::test]
async fn retry_rejects_exhausted_and_unfailed_deliveries() {
    let app = TestApp::new().await;
    let exhausted = failed_delivery(&app, 4).await;
    assert_eq!(exhausted.max_attempts, 4);

    let (status, error) =
        app.post(&format!("/v1/deliveries/{}/retry", exhausted.id), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"]["code"], "CONFLICT");

    let tenant = Uuid::new_v4();
    subscribed(&app, tenant, "p", &["user.created"]).await;
    let (_, published) = app
        .post(&format!("/v1/tenants/{tenant}/events"), json!({"event_type": "user.created"}))
        .await;
    let (_, pending) = app
        .get(&format!("/v1/deliveries?event_id={}", published["event_id"].as_str().unwrap()))
        .await;
    let pending_id = pending[0]["id"].as_str().unwrap();
    let (status, _) = app.post(&format!("/v1/deliveries/{pending_id}/retry"), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) =
        app.post(&format!("/v1/deliveries/{}/retry", Uuid::new_v4()), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn catalog_lists_builtins_and_toggles_activity() {
    let app = TestApp::new().await;

    let (status, types) = app.get("/v1/event-types").await;
    assert_eq!(status, StatusCode::OK);
    let types = types.as_array().unwrap();
    assert_eq!(types.len(), 11);
    let test_type = types.iter().find(|t| t["event_type"] == "system.test").unwrap();
    assert_eq!(test_type["is_system"], true);

    let (status, updated) =
        app.patch("/v1/event-types/system.maintenance", json!({"is_active": false})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["is_active"], false);

    let tenant = Uuid::new_v4();
    subscribed(&app, tenant, "ops", &["system.maintenance"]).await;
    app.post(&format!("/v1/tenants/{tenant}/events"), json!({"event_type": "system.maintenance"}))
        .await;
    assert!(app.storage.deliveries().await.is_empty());

    let (status, _) = app.patch("/v1/event-types/made.up", json!({"is_active": true})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, error) = app.patch("/v1/event-types/user.created", json!({"active": 1})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"]["code"], "VALIDATION_ERROR");
}

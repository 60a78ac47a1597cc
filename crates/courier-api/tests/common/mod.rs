//! Router harness over in-memory storage and a controllable clock.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use courier_api::{create_router, AppState};
use courier_core::TestClock;
use courier_delivery::{
    seed_catalog, storage::mock::MockDeliveryStorage, DeliveryConfig, DeliveryEngine,
    WorkerPool,
};
use serde_json::Value;
use tower::ServiceExt;

pub struct TestApp {
    pub storage: Arc<MockDeliveryStorage>,
    pub clock: TestClock,
    pub engine: Arc<DeliveryEngine>,
    router: Router,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(false).await
    }

    /// Reports a worker pool that was created but never started.
    pub async fn with_stopped_workers() -> Self {
        Self::build(true).await
    }

    async fn build(stopped_workers: bool) -> Self {
        let storage = Arc::new(MockDeliveryStorage::new());
        seed_catalog(storage.as_ref()).await.expect("catalog seed should succeed");
        let clock = TestClock::new();
        let engine = Arc::new(
            DeliveryEngine::new(storage.clone(), DeliveryConfig::default(), Arc::new(clock.clone()))
                .expect("engine should build"),
        );

        let mut state = AppState::new(storage.clone(), engine.clone(), Arc::new(clock.clone()));
        if stopped_workers {
            let pool = WorkerPool::new(engine.clone(), Arc::new(clock.clone()));
            state = state.with_workers(pool.monitor());
        }
        let router = create_router(state, Duration::from_secs(30));

        Self { storage, clock, engine, router }
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call(Method::POST, uri, Some(body)).await
    }

    pub async fn patch(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call(Method::PATCH, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Method::DELETE, uri, None).await
    }

    pub async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request should build");

        let response = self.router.clone().oneshot(request).await.expect("router should answer");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("response should be JSON")
        };
        (status, json)
    }

    pub async fn raw(&self, request: Request<Body>) -> axum::response::Response {
        self.router.clone().oneshot(request).await.expect("router should answer")
    }

    /// Creates an endpoint through the API and returns its JSON.
    pub async fn create_endpoint(&self, tenant: uuid::Uuid, body: Value) -> Value {
        let (status, json) = self.post(&format!("/v1/tenants/{tenant}/endpoints"), body).await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {json}");
        json
    }
}

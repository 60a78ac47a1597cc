//! Health check handlers for service monitoring.
//!
//! `/health` pings the database and reports delivery worker liveness,
//! `/ready` gates traffic on both, `/live` only proves the process answers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::Clock;
use courier_delivery::{DeliveryStorage, EngineStats, WorkerMonitor};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Delivery counters since startup
    pub delivery: EngineStats,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Database up but some delivery workers are gone
    Degraded,
    /// Database unreachable
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Database connectivity
    pub database: ComponentHealth,
    /// Delivery worker pool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerHealth>,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Worker pool liveness.
#[derive(Debug, Serialize)]
pub struct WorkerHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Workers running
    pub active: usize,
    /// Workers configured
    pub configured: usize,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Runs component checks against an injected clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks the database and, when present, the worker pool.
    pub async fn health_check(
        &self,
        storage: &dyn DeliveryStorage,
        workers: Option<&WorkerMonitor>,
        delivery: EngineStats,
    ) -> HealthResponse {
        debug!("Performing health check");

        let timestamp = self.clock.now_utc();
        let database = self.check_database(storage).await;
        let workers = workers.map(|monitor| WorkerHealth {
            status: if monitor.is_healthy() { ComponentStatus::Up } else { ComponentStatus::Down },
            active: monitor.active_workers(),
            configured: monitor.configured_workers(),
        });

        let status = match (database.status, workers.as_ref().map(|w| w.status)) {
            (ComponentStatus::Down, _) => HealthStatus::Unhealthy,
            (ComponentStatus::Up, Some(ComponentStatus::Down)) => HealthStatus::Degraded,
            (ComponentStatus::Up, _) => HealthStatus::Healthy,
        };

        HealthResponse {
            status,
            timestamp,
            checks: HealthChecks { database, workers },
            delivery,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn check_database(&self, storage: &dyn DeliveryStorage) -> ComponentHealth {
        let started = self.clock.now();
        let result = storage.health_check().await;
        let elapsed = self.clock.now().saturating_duration_since(started);
        let response_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms },
            Err(e) => {
                error!(error = %e, "database health check failed");
                ComponentHealth {
                    status: ComponentStatus::Down,
                    message: Some(format!("Database connection failed: {e}")),
                    response_time_ms,
                }
            },
        }
    }
}

async fn run_checks(state: &AppState) -> HealthResponse {
    HealthService::new(Arc::clone(&state.clock))
        .health_check(state.storage.as_ref(), state.workers.as_ref(), state.engine.stats().await)
        .await
}

/// Health check endpoint handler.
///
/// Degraded still answers 200 so load balancers keep the API reachable.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let response = run_checks(&state).await;
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?response.status, "Health check completed");
    (status_code, Json(response)).into_response()
}

/// Readiness probe: 200 only when every component is up.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    let response = run_checks(&state).await;
    let status_code = if response.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response)).into_response()
}

/// Liveness probe; touches no dependencies.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "courier",
    });

    (StatusCode::OK, Json(response)).into_response()
}

//! Event occurrence audit trail.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use courier_core::{Delivery, EventId, EventLog, EventLogQuery, TenantId};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

/// Occurrence with its computed success rate.
#[derive(Debug, Serialize)]
pub struct EventLogResponse {
    /// The occurrence.
    #[serde(flatten)]
    pub log: EventLog,
    /// Share of notified endpoints that received it.
    pub success_rate: Option<f64>,
}

impl From<EventLog> for EventLogResponse {
    fn from(log: EventLog) -> Self {
        let success_rate = log.success_rate();
        Self { log, success_rate }
    }
}

/// Occurrence together with its deliveries.
#[derive(Debug, Serialize)]
pub struct EventLogDetail {
    /// The occurrence.
    #[serde(flatten)]
    pub event: EventLogResponse,
    /// One delivery per notified endpoint.
    pub deliveries: Vec<Delivery>,
}

/// Lists a tenant's occurrences, newest first.
#[instrument(name = "list_event_logs", skip(state))]
pub async fn list_event_logs(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<EventLogQuery>,
) -> ApiResult<Json<Vec<EventLogResponse>>> {
    let logs = state.storage.list_event_logs(TenantId::from(tenant_id), query).await?;
    Ok(Json(logs.into_iter().map(EventLogResponse::from).collect()))
}

/// Reads one occurrence with its deliveries.
#[instrument(name = "get_event_log", skip(state))]
pub async fn get_event_log(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<Json<EventLogDetail>> {
    let event_id = EventId::from(event_id);
    let log = state
        .storage
        .find_event_log(event_id)
        .await?
        .ok_or_else(|| ApiError::not_found("event", event_id))?;
    let deliveries = state.storage.find_deliveries_by_event(event_id).await?;

    Ok(Json(EventLogDetail { event: log.into(), deliveries }))
}

//! Event catalog handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use courier_core::EventDefinition;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::{
    error::{ApiError, ApiJson, ApiResult},
    AppState,
};

/// Lists every catalog entry, active or not.
#[instrument(name = "list_event_types", skip(state))]
pub async fn list_event_types(State(state): State<AppState>) -> ApiResult<Json<Vec<EventDefinition>>> {
    Ok(Json(state.storage.list_event_definitions().await?))
}

/// Body of `PATCH /v1/event-types/{event_type}`.
#[derive(Debug, Deserialize)]
pub struct UpdateEventTypeRequest {
    /// Whether the type may be dispatched.
    pub is_active: bool,
}

/// Enables or disables dispatch of an event type.
#[instrument(name = "update_event_type", skip(state, body))]
pub async fn update_event_type(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
    ApiJson(body): ApiJson<UpdateEventTypeRequest>,
) -> ApiResult<Json<EventDefinition>> {
    if !state.storage.set_event_definition_active(event_type.clone(), body.is_active).await? {
        return Err(ApiError::not_found("event type", &event_type));
    }
    info!(%event_type, is_active = body.is_active, "event type updated");

    state
        .storage
        .find_event_definition(event_type.clone())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("event type", &event_type))
}

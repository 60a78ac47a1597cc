//! Producer-facing event publishing.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use courier_core::{EventId, SourceRef, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    error::{ApiJson, ApiResult},
    AppState,
};

/// Body of `POST /v1/tenants/{tenant_id}/events`.
#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    /// Catalog event type.
    pub event_type: String,
    /// Event payload; an empty object when omitted.
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// Originating domain object.
    #[serde(default)]
    pub source: Option<SourceRef>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Response to a publish request.
#[derive(Debug, Serialize)]
pub struct PublishEventResponse {
    /// Identifier of the occurrence.
    pub event_id: EventId,
}

/// Publishes an event for fan-out.
///
/// Always accepted: unknown event types and storage failures are logged by
/// the dispatcher and never surface to the producer.
#[instrument(name = "publish_event", skip(state, body), fields(event_type = %body.event_type))]
pub async fn publish_event(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ApiJson(body): ApiJson<PublishEventRequest>,
) -> ApiResult<(StatusCode, Json<PublishEventResponse>)> {
    let event_id = state
        .dispatcher
        .dispatch_event(&body.event_type, body.payload, TenantId::from(tenant_id), body.source)
        .await;

    Ok((StatusCode::ACCEPTED, Json(PublishEventResponse { event_id })))
}

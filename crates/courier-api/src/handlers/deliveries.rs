//! Delivery inspection and manual retry.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use courier_core::{Delivery, DeliveryId, DeliveryQuery};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

/// Lists deliveries filtered by endpoint, occurrence or status.
#[instrument(name = "list_deliveries", skip(state))]
pub async fn list_deliveries(
    State(state): State<AppState>,
    Query(query): Query<DeliveryQuery>,
) -> ApiResult<Json<Vec<Delivery>>> {
    Ok(Json(state.storage.list_deliveries(query).await?))
}

/// Reads one delivery.
#[instrument(name = "get_delivery", skip(state))]
pub async fn get_delivery(
    State(state): State<AppState>,
    Path(delivery_id): Path<Uuid>,
) -> ApiResult<Json<Delivery>> {
    let delivery_id = DeliveryId::from(delivery_id);
    state
        .storage
        .find_delivery(delivery_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("delivery", delivery_id))
}

/// Makes a failed delivery with attempts left due immediately.
///
/// Answers 409 for deliveries that are not failed or have exhausted their
/// attempts.
#[instrument(name = "retry_delivery", skip(state))]
pub async fn retry_delivery(
    State(state): State<AppState>,
    Path(delivery_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Delivery>)> {
    let delivery_id = DeliveryId::from(delivery_id);
    let current = state
        .storage
        .find_delivery(delivery_id)
        .await?
        .ok_or_else(|| ApiError::not_found("delivery", delivery_id))?;

    match state.engine.schedule_retry(delivery_id).await? {
        Some(delivery) => {
            info!(%delivery_id, attempt = delivery.attempt_number, "retry requested");
            Ok((StatusCode::ACCEPTED, Json(delivery)))
        },
        None => Err(ApiError::Conflict(format!(
            "delivery {delivery_id} is {} with {} of {} attempts used and cannot be retried",
            current.status, current.attempt_number, current.max_attempts
        ))),
    }
}

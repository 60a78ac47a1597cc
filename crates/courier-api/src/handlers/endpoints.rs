//! Endpoint registry handlers.
//!
//! Creation generates the signing secret server-side and returns it exactly
//! once; every other response omits it. Breaker overrides (`suspend`,
//! `reactivate`) and the synchronous `test` action live here too.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{
    models::minutes_from, DeliveryStatus, Endpoint, EndpointId, EndpointStatus, FilterConditions,
    HttpMethod, TenantId,
};
use courier_delivery::{signing::generate_secret, TEST_EVENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiJson, ApiResult},
    AppState,
};

/// Longest accepted manual suspension, one week.
const MAX_SUSPENSION_MINUTES: i64 = 7 * 24 * 60;

/// Endpoint as returned by the API, without its secret.
#[derive(Debug, Serialize)]
pub struct EndpointResponse {
    /// Identifier.
    pub id: EndpointId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Name, unique within the tenant.
    pub name: String,
    /// Target URL.
    pub url: String,
    /// Request method.
    pub http_method: HttpMethod,
    /// Content type header.
    pub content_type: String,
    /// Extra headers.
    pub custom_headers: HashMap<String, String>,
    /// Payload filter.
    pub filter_conditions: FilterConditions,
    /// Subscribed event types.
    pub subscribed_events: Vec<String>,
    /// Retries after the first attempt.
    pub max_retries: i32,
    /// Base retry delay.
    pub retry_delay_seconds: i32,
    /// Request timeout.
    pub timeout_seconds: i32,
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: i32,
    /// Current status.
    pub status: EndpointStatus,
    /// Current failure streak.
    pub consecutive_failures: i32,
    /// End of the current suspension.
    pub suspended_until: Option<DateTime<Utc>>,
    /// Attempts made.
    pub total_deliveries: i64,
    /// Attempts answered 2xx.
    pub successful_deliveries: i64,
    /// Attempts that failed.
    pub failed_deliveries: i64,
    /// Share of attempts that succeeded.
    pub success_rate: Option<f64>,
    /// Last attempt.
    pub last_delivery_at: Option<DateTime<Utc>>,
    /// Last success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last configuration change.
    pub updated_at: DateTime<Utc>,
}

impl From<Endpoint> for EndpointResponse {
    fn from(endpoint: Endpoint) -> Self {
        let success_rate = endpoint.success_rate();
        Self {
            id: endpoint.id,
            tenant_id: endpoint.tenant_id,
            name: endpoint.name,
            url: endpoint.url,
            http_method: endpoint.http_method,
            content_type: endpoint.content_type,
            custom_headers: endpoint.custom_headers.0,
            filter_conditions: endpoint.filter_conditions.0,
            subscribed_events: endpoint.subscribed_events,
            max_retries: endpoint.max_retries,
            retry_delay_seconds: endpoint.retry_delay_seconds,
            timeout_seconds: endpoint.timeout_seconds,
            failure_threshold: endpoint.failure_threshold,
            status: endpoint.status,
            consecutive_failures: endpoint.consecutive_failures,
            suspended_until: endpoint.suspended_until,
            total_deliveries: endpoint.total_deliveries,
            successful_deliveries: endpoint.successful_deliveries,
            failed_deliveries: endpoint.failed_deliveries,
            success_rate,
            last_delivery_at: endpoint.last_delivery_at,
            last_success_at: endpoint.last_success_at,
            created_at: endpoint.created_at,
            updated_at: endpoint.updated_at,
        }
    }
}

/// Creation response; the only place the secret is ever returned.
#[derive(Debug, Serialize)]
pub struct CreatedEndpointResponse {
    /// The stored endpoint.
    #[serde(flatten)]
    pub endpoint: EndpointResponse,
    /// Signing secret for subscriber verification.
    pub secret: String,
}

/// Body of `POST /v1/tenants/{tenant_id}/endpoints`.
#[derive(Debug, Deserialize)]
pub struct CreateEndpointRequest {
    /// Name, unique within the tenant.
    pub name: String,
    /// Target URL, http or https.
    pub url: String,
    /// Request method, POST by default.
    #[serde(default)]
    pub http_method: HttpMethod,
    /// Content type header, `application/json` by default.
    pub content_type: Option<String>,
    /// Extra headers merged into every request.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    /// Payload filter.
    #[serde(default)]
    pub filter_conditions: FilterConditions,
    /// Event types to receive.
    #[serde(default)]
    pub subscribed_events: Vec<String>,
    /// Retries after the first attempt.
    pub max_retries: Option<i32>,
    /// Base retry delay.
    pub retry_delay_seconds: Option<i32>,
    /// Request timeout.
    pub timeout_seconds: Option<i32>,
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: Option<i32>,
}

/// Body of `PATCH /v1/endpoints/{endpoint_id}`; absent fields are kept.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateEndpointRequest {
    /// New name.
    pub name: Option<String>,
    /// New target URL.
    pub url: Option<String>,
    /// New request method.
    pub http_method: Option<HttpMethod>,
    /// New content type.
    pub content_type: Option<String>,
    /// Replacement custom headers.
    pub custom_headers: Option<HashMap<String, String>>,
    /// Replacement filter.
    pub filter_conditions: Option<FilterConditions>,
    /// Replacement subscriptions.
    pub subscribed_events: Option<Vec<String>>,
    /// New retry budget.
    pub max_retries: Option<i32>,
    /// New base delay.
    pub retry_delay_seconds: Option<i32>,
    /// New timeout.
    pub timeout_seconds: Option<i32>,
    /// New breaker threshold.
    pub failure_threshold: Option<i32>,
    /// `active`, `inactive` or `failed`.
    pub status: Option<EndpointStatus>,
}

/// Body of `POST /v1/endpoints/{endpoint_id}/suspend`.
#[derive(Debug, Deserialize)]
pub struct SuspendRequest {
    /// Length of the suspension.
    pub duration_minutes: i64,
}

/// Result of a synchronous test delivery.
#[derive(Debug, Serialize)]
pub struct TestDeliveryResponse {
    /// Whether the subscriber answered 2xx.
    pub success: bool,
    /// Test delivery.
    pub delivery_id: courier_core::DeliveryId,
    /// Test occurrence.
    pub event_id: courier_core::EventId,
    /// Delivery status after the attempt.
    pub status: DeliveryStatus,
    /// Subscriber status code.
    pub response_status: Option<i32>,
    /// Round trip time.
    pub duration_ms: Option<i64>,
    /// Classified failure code.
    pub error_code: Option<String>,
    /// Failure detail.
    pub error_message: Option<String>,
}

/// Registers an endpoint.
#[instrument(name = "create_endpoint", skip(state, body), fields(name = %body.name))]
pub async fn create_endpoint(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ApiJson(body): ApiJson<CreateEndpointRequest>,
) -> ApiResult<(StatusCode, Json<CreatedEndpointResponse>)> {
    let now = state.clock.now_utc();
    let mut endpoint =
        Endpoint::new(TenantId::from(tenant_id), body.name, body.url, generate_secret(), now)
            .subscribed_to(body.subscribed_events)
            .with_filter(body.filter_conditions);
    endpoint.http_method = body.http_method;
    if let Some(content_type) = body.content_type {
        endpoint.content_type = content_type;
    }
    endpoint.custom_headers.0 = body.custom_headers;
    endpoint.max_retries = body.max_retries.unwrap_or(endpoint.max_retries);
    endpoint.retry_delay_seconds = body.retry_delay_seconds.unwrap_or(endpoint.retry_delay_seconds);
    endpoint.timeout_seconds = body.timeout_seconds.unwrap_or(endpoint.timeout_seconds);
    endpoint.failure_threshold = body.failure_threshold.unwrap_or(endpoint.failure_threshold);

    validate_endpoint(&state, &endpoint).await?;
    state.storage.create_endpoint(endpoint.clone()).await?;
    info!(endpoint_id = %endpoint.id, tenant_id = %endpoint.tenant_id, "endpoint created");

    let secret = endpoint.secret.clone();
    Ok((
        StatusCode::CREATED,
        Json(CreatedEndpointResponse { endpoint: endpoint.into(), secret }),
    ))
}

/// Lists a tenant's endpoints.
#[instrument(name = "list_endpoints", skip(state))]
pub async fn list_endpoints(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Vec<EndpointResponse>>> {
    let endpoints = state.storage.list_endpoints(TenantId::from(tenant_id)).await?;
    Ok(Json(endpoints.into_iter().map(EndpointResponse::from).collect()))
}

/// Reads one endpoint.
#[instrument(name = "get_endpoint", skip(state))]
pub async fn get_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<Uuid>,
) -> ApiResult<Json<EndpointResponse>> {
    Ok(Json(load(&state, EndpointId::from(endpoint_id)).await?.into()))
}

/// Applies a partial update.
#[instrument(name = "update_endpoint", skip(state, body))]
pub async fn update_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<Uuid>,
    ApiJson(body): ApiJson<UpdateEndpointRequest>,
) -> ApiResult<Json<EndpointResponse>> {
    let mut endpoint = load(&state, EndpointId::from(endpoint_id)).await?;

    if let Some(status) = body.status {
        if status == EndpointStatus::Suspended {
            return Err(ApiError::Validation(
                "use the suspend action to suspend an endpoint".to_string(),
            ));
        }
        if status != endpoint.status {
            endpoint.status = status;
            endpoint.suspended_until = None;
        }
    }
    if let Some(name) = body.name {
        endpoint.name = name;
    }
    if let Some(url) = body.url {
        endpoint.url = url;
    }
    if let Some(http_method) = body.http_method {
        endpoint.http_method = http_method;
    }
    if let Some(content_type) = body.content_type {
        endpoint.content_type = content_type;
    }
    if let Some(headers) = body.custom_headers {
        endpoint.custom_headers.0 = headers;
    }
    if let Some(filter) = body.filter_conditions {
        endpoint.filter_conditions.0 = filter;
    }
    if let Some(events) = body.subscribed_events {
        endpoint.subscribed_events = events;
    }
    endpoint.max_retries = body.max_retries.unwrap_or(endpoint.max_retries);
    endpoint.retry_delay_seconds = body.retry_delay_seconds.unwrap_or(endpoint.retry_delay_seconds);
    endpoint.timeout_seconds = body.timeout_seconds.unwrap_or(endpoint.timeout_seconds);
    endpoint.failure_threshold = body.failure_threshold.unwrap_or(endpoint.failure_threshold);
    endpoint.updated_at = state.clock.now_utc();

    validate_endpoint(&state, &endpoint).await?;
    state.storage.update_endpoint(endpoint.clone()).await?;
    info!(endpoint_id = %endpoint.id, "endpoint updated");

    Ok(Json(load(&state, endpoint.id).await?.into()))
}

/// Deletes an endpoint and its deliveries.
#[instrument(name = "delete_endpoint", skip(state))]
pub async fn delete_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let endpoint_id = EndpointId::from(endpoint_id);
    if !state.storage.delete_endpoint(endpoint_id).await? {
        return Err(ApiError::not_found("endpoint", endpoint_id));
    }
    info!(%endpoint_id, "endpoint deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Sends a `system.test` event to the endpoint and waits for the attempt.
///
/// The delivery ignores subscriptions and filters but still goes through
/// the engine, so a suspended or disabled endpoint reports that outcome.
#[instrument(name = "test_endpoint", skip(state))]
pub async fn test_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<Uuid>,
) -> ApiResult<Json<TestDeliveryResponse>> {
    let endpoint = load(&state, EndpointId::from(endpoint_id)).await?;
    let payload = json!({
        "message": "Test event from courier",
        "endpoint_id": endpoint.id,
        "endpoint_name": endpoint.name,
        "timestamp": state.clock.now_utc(),
    });

    let delivery = state.dispatcher.dispatch_to_endpoint(&endpoint, TEST_EVENT_TYPE, payload).await?;
    let delivery_id = delivery.id;
    let success = state.engine.deliver_claimed(delivery).await?;
    let delivery = state
        .storage
        .find_delivery(delivery_id)
        .await?
        .ok_or_else(|| ApiError::not_found("delivery", delivery_id))?;

    if !success {
        warn!(endpoint_id = %endpoint.id, error_code = ?delivery.error_code, "test delivery failed");
    }

    Ok(Json(TestDeliveryResponse {
        success,
        delivery_id: delivery.id,
        event_id: delivery.event_id,
        status: delivery.status,
        response_status: delivery.response_status,
        duration_ms: delivery.duration_ms,
        error_code: delivery.error_code,
        error_message: delivery.error_message,
    }))
}

/// Suspends an endpoint for a fixed number of minutes.
#[instrument(name = "suspend_endpoint", skip(state, body))]
pub async fn suspend_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<Uuid>,
    ApiJson(body): ApiJson<SuspendRequest>,
) -> ApiResult<Json<EndpointResponse>> {
    if !(1..=MAX_SUSPENSION_MINUTES).contains(&body.duration_minutes) {
        return Err(ApiError::Validation(format!(
            "duration_minutes must be between 1 and {MAX_SUSPENSION_MINUTES}"
        )));
    }

    let endpoint_id = EndpointId::from(endpoint_id);
    let until = minutes_from(state.clock.now_utc(), body.duration_minutes);
    if !state.storage.suspend_endpoint(endpoint_id, until).await? {
        return Err(ApiError::not_found("endpoint", endpoint_id));
    }
    warn!(%endpoint_id, suspended_until = %until, "endpoint suspended by operator");

    Ok(Json(load(&state, endpoint_id).await?.into()))
}

/// Reactivates an endpoint and clears its failure streak.
#[instrument(name = "reactivate_endpoint", skip(state))]
pub async fn reactivate_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<Uuid>,
) -> ApiResult<Json<EndpointResponse>> {
    let endpoint_id = EndpointId::from(endpoint_id);
    if !state.storage.reactivate_endpoint(endpoint_id).await? {
        return Err(ApiError::not_found("endpoint", endpoint_id));
    }
    info!(%endpoint_id, "endpoint reactivated by operator");

    Ok(Json(load(&state, endpoint_id).await?.into()))
}

async fn load(state: &AppState, endpoint_id: EndpointId) -> ApiResult<Endpoint> {
    state
        .storage
        .find_endpoint(endpoint_id)
        .await?
        .ok_or_else(|| ApiError::not_found("endpoint", endpoint_id))
}

/// Checks policy ranges, the URL scheme and that subscriptions exist.
async fn validate_endpoint(state: &AppState, endpoint: &Endpoint) -> ApiResult<()> {
    endpoint.validate()?;
    validate_url(&endpoint.url)?;

    for event_type in &endpoint.subscribed_events {
        if state.storage.find_event_definition(event_type.clone()).await?.is_none() {
            return Err(ApiError::Validation(format!("unknown event type: {event_type}")));
        }
    }
    Ok(())
}

fn validate_url(raw: &str) -> ApiResult<()> {
    let url = Url::parse(raw).map_err(|e| ApiError::Validation(format!("invalid url: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(()),
        "http" | "https" => Err(ApiError::Validation("url must include a host".to_string())),
        scheme => Err(ApiError::Validation(format!("url scheme must be http or https, got {scheme}"))),
    }
}

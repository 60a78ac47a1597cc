//! HTTP server setup and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response tracing
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! The server stops accepting connections on SIGINT or SIGTERM and waits
//! for in-flight requests before returning.

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, patch, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{
    handlers::{self, deliveries, endpoints, event_logs, event_types, events},
    AppState,
};

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Creates the router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
///
/// use courier_api::{create_router, AppState};
/// use courier_core::RealClock;
/// use courier_delivery::{storage::mock::MockDeliveryStorage, DeliveryConfig, DeliveryEngine};
///
/// let storage = Arc::new(MockDeliveryStorage::new());
/// let clock = Arc::new(RealClock::new());
/// let engine = DeliveryEngine::new(storage.clone(), DeliveryConfig::default(), clock.clone())
///     .expect("engine");
/// let app = create_router(AppState::new(storage, Arc::new(engine), clock), Duration::from_secs(30));
/// ```
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check));

    let api_routes = Router::new()
        .route("/v1/event-types", get(event_types::list_event_types))
        .route("/v1/event-types/{event_type}", patch(event_types::update_event_type))
        .route("/v1/tenants/{tenant_id}/events", post(events::publish_event))
        .route(
            "/v1/tenants/{tenant_id}/endpoints",
            post(endpoints::create_endpoint).get(endpoints::list_endpoints),
        )
        .route(
            "/v1/endpoints/{endpoint_id}",
            get(endpoints::get_endpoint)
                .patch(endpoints::update_endpoint)
                .delete(endpoints::delete_endpoint),
        )
        .route("/v1/endpoints/{endpoint_id}/test", post(endpoints::test_endpoint))
        .route("/v1/endpoints/{endpoint_id}/suspend", post(endpoints::suspend_endpoint))
        .route("/v1/endpoints/{endpoint_id}/reactivate", post(endpoints::reactivate_endpoint))
        .route("/v1/deliveries", get(deliveries::list_deliveries))
        .route("/v1/deliveries/{delivery_id}", get(deliveries::get_delivery))
        .route("/v1/deliveries/{delivery_id}/retry", post(deliveries::retry_delivery))
        .route("/v1/tenants/{tenant_id}/event-logs", get(event_logs::list_event_logs))
        .route("/v1/event-logs/{event_id}", get(event_logs::get_event_log));

    Router::new()
        .merge(health_routes)
        .merge(api_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Tags the request and its response with an `X-Request-Id`.
///
/// A caller-supplied id is kept so traces join up across services.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    req.extensions_mut().insert(request_id.clone());
    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }
    response
}

/// Serves the API on `addr` until a shutdown signal arrives.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or serving
/// fails.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    request_timeout: Duration,
) -> Result<(), std::io::Error> {
    let app = create_router(state, request_timeout);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received CTRL+C, starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}

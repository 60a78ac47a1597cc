//! HTTP client for webhook delivery.
//!
//! Builds the signed outbound request for a delivery and executes it with
//! the endpoint's method and timeout. Any HTTP response, 2xx or not, comes
//! back as a [`WebhookResponse`]; only transport failures are errors.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use courier_core::{Delivery, DeliveryId, Endpoint, EventId, HttpMethod};
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::{self, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER},
};

/// Largest response body kept on a delivery record.
pub const MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout applied when a request carries none of its own.
    pub default_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            user_agent: "Courier-Webhooks/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// Outbound request body. Field order is the wire order.
#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    event_id: EventId,
    event_type: &'a str,
    timestamp: String,
    data: &'a Value,
}

/// A fully built, signed webhook request.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Delivery being attempted.
    pub delivery_id: DeliveryId,
    /// Attempt number, for tracing.
    pub attempt_number: i32,
    /// HTTP method.
    pub method: HttpMethod,
    /// Destination URL.
    pub url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Every header sent, custom headers included.
    pub headers: HashMap<String, String>,
    /// Exact body bytes that were signed.
    pub body: Bytes,
}

impl WebhookRequest {
    /// Serializes and signs `delivery` for `endpoint` as of `now`.
    ///
    /// # Errors
    ///
    /// Returns `Request` if the payload cannot be serialized, or
    /// `Configuration` if the endpoint secret cannot sign it.
    pub fn build(endpoint: &Endpoint, delivery: &Delivery, now: DateTime<Utc>) -> Result<Self> {
        let body = serde_json::to_vec(&WebhookBody {
            event_id: delivery.event_id,
            event_type: &delivery.event_type,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            data: &delivery.payload.0,
        })
        .map_err(|e| DeliveryError::request(format!("failed to serialize payload: {e}")))?;

        let mut headers: HashMap<String, String> = endpoint
            .custom_headers
            .0
            .iter()
            .filter(|(name, _)| !is_managed_header(name) && !is_reserved_header(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        headers.insert("Content-Type".to_string(), endpoint.content_type.clone());
        headers.insert(SIGNATURE_HEADER.to_string(), signing::sign(&body, &endpoint.secret)?);
        headers.insert(EVENT_HEADER.to_string(), delivery.event_type.clone());
        headers.insert(DELIVERY_HEADER.to_string(), delivery.id.to_string());
        headers.insert(TIMESTAMP_HEADER.to_string(), now.timestamp().to_string());

        Ok(Self {
            delivery_id: delivery.id,
            attempt_number: delivery.attempt_number,
            method: endpoint.http_method,
            url: endpoint.url.clone(),
            timeout: Duration::from_secs(u64::try_from(endpoint.timeout_seconds).unwrap_or(30)),
            headers,
            body: Bytes::from(body),
        })
    }

    /// Body as text, for the delivery record.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Response to a webhook request.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated to [`MAX_RESPONSE_BODY_BYTES`].
    pub body: String,
    /// Time from send to full body.
    pub duration: Duration,
}

impl WebhookResponse {
    /// Whether the status is in `[200, 300)`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// HTTP client shared by all delivery workers.
///
/// Wraps a pooled `reqwest::Client`; cloning is cheap.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.default_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&ClientConfig::default())
    }

    /// Sends `request` and reads the response.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request exceeds its timeout
    /// - `Network` for connection failures
    /// - `Request` when the request cannot be built or sent
    pub async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            url = %request.url,
            method = request.method.as_str(),
            attempt = request.attempt_number
        );

        async move {
            let start_time = std::time::Instant::now();

            let mut http_request = self
                .client
                .request(method(request.method), &request.url)
                .timeout(request.timeout)
                .body(request.body.clone());
            for (name, value) in &request.headers {
                http_request = http_request.header(name, value);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        duration_ms = start_time.elapsed().as_millis(),
                        error = %e,
                        "request failed"
                    );
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(request.timeout.as_secs()));
                    }
                    return Err(e.into());
                },
            };

            let response = read_response(response, start_time).await;
            tracing::debug!(
                status = response.status_code,
                duration_ms = response.duration.as_millis(),
                "received response"
            );
            Ok(response)
        }
        .instrument(span)
        .await
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}

async fn read_response(response: Response, start_time: std::time::Instant) -> WebhookResponse {
    let status_code = response.status().as_u16();
    let headers = extract_headers(response.headers());

    let body = match response.bytes().await {
        Ok(bytes) => truncate_body(&String::from_utf8_lossy(&bytes)),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    };

    WebhookResponse { status_code, headers, body, duration: start_time.elapsed() }
}

/// Cuts `body` to at most [`MAX_RESPONSE_BODY_BYTES`] on a char boundary.
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_RESPONSE_BODY_BYTES {
        return body.to_string();
    }
    let mut end = MAX_RESPONSE_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Extracts headers from reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| {
            value.to_str().ok().map(|value| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Hop-by-hop and transport headers set by the HTTP stack.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers a custom header may not override.
fn is_reserved_header(header_name: &str) -> bool {
    [SIGNATURE_HEADER, EVENT_HEADER, DELIVERY_HEADER, TIMESTAMP_HEADER, "Content-Type"]
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(header_name))
}

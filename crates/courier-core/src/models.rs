//! Domain models and strongly-typed identifiers.
//!
//! Covers the four persistent entities of the delivery pipeline:
//!
//! ```text
//! EventDefinition ──< subscriptions >── Endpoint ──owns──< Delivery
//!                                                            │
//!                      EventLog (one per dispatch) ──────────┘ shared event_id
//! ```
//!
//! State that changes under concurrent workers (claiming, counters, breaker
//! state) is mutated through single-statement repository updates, never by
//! writing these structs back.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    filter::FilterConditions,
};

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

/// Inclusive bounds for `Endpoint::max_retries`.
pub const MAX_RETRIES_RANGE: (i32, i32) = (0, 10);
/// Inclusive bounds for `Endpoint::retry_delay_seconds`.
pub const RETRY_DELAY_RANGE: (i32, i32) = (1, 3600);
/// Inclusive bounds for `Endpoint::timeout_seconds`.
pub const TIMEOUT_RANGE: (i32, i32) = (5, 300);
/// Inclusive bounds for `Endpoint::failure_threshold`.
pub const FAILURE_THRESHOLD_RANGE: (i32, i32) = (1, 100);

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

/// Stores an enum as its lowercase text form.
macro_rules! text_column {
    ($name:ident) => {
        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <str as sqlx::Type<PgDb>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <&str as sqlx::Type<PgDb>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                s.parse().map_err(|e: CoreError| e.to_string().into())
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

uuid_id!(
    /// Identifier of one dispatched event occurrence.
    ///
    /// Shared by every delivery fanned out from the occurrence so subscribers
    /// can deduplicate retries.
    EventId
);

uuid_id!(
    /// Tenant scope for endpoints, event logs and deliveries.
    TenantId
);

uuid_id!(
    /// Identifier of a registered subscriber endpoint.
    EndpointId
);

uuid_id!(
    /// Identifier of a single delivery record.
    DeliveryId
);

/// Business area an event type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Account lifecycle events.
    User,
    /// Stock level events.
    Inventory,
    /// Ledger transaction events.
    Transaction,
    /// Payment events.
    Payment,
    /// Platform events such as connectivity tests.
    System,
}

impl EventCategory {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Inventory => "inventory",
            Self::Transaction => "transaction",
            Self::Payment => "payment",
            Self::System => "system",
        }
    }
}

impl FromStr for EventCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "inventory" => Ok(Self::Inventory),
            "transaction" => Ok(Self::Transaction),
            "payment" => Ok(Self::Payment),
            "system" => Ok(Self::System),
            _ => Err(CoreError::invalid(format!("unknown event category: {s}"))),
        }
    }
}

text_column!(EventCategory);

/// Catalog entry for a known event type.
///
/// Dispatch for a type that is missing from the catalog or inactive is a
/// silent no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventDefinition {
    /// `category.action` identifier, globally unique.
    pub event_type: String,

    /// Display name.
    pub name: String,

    /// Business area.
    pub category: EventCategory,

    /// Advisory JSON schema describing the payload. Never enforced.
    pub schema: Json<Value>,

    /// Built-in platform event.
    pub is_system: bool,

    /// Inactive definitions are ignored by dispatch.
    pub is_active: bool,
}

impl EventDefinition {
    /// Creates an active, non-system definition.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when `event_type` lacks the `.` separator or
    /// has an empty category or action.
    pub fn new(
        event_type: impl Into<String>,
        name: impl Into<String>,
        category: EventCategory,
    ) -> Result<Self> {
        let event_type = event_type.into();
        validate_event_type(&event_type)?;

        Ok(Self {
            event_type,
            name: name.into(),
            category,
            schema: Json(Value::Object(serde_json::Map::new())),
            is_system: false,
            is_active: true,
        })
    }

    /// Marks the definition as a built-in system event.
    #[must_use]
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    /// Attaches an advisory payload schema.
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Json(schema);
        self
    }

    /// Returns the `category` part of `category.action`.
    pub fn prefix(&self) -> &str {
        self.event_type.split_once('.').map_or(self.event_type.as_str(), |(prefix, _)| prefix)
    }
}

/// Validates the `category.action` shape of an event type identifier.
///
/// # Errors
///
/// Returns `InvalidInput` when the identifier is malformed.
pub fn validate_event_type(event_type: &str) -> Result<()> {
    match event_type.split_once('.') {
        Some((category, action)) if !category.is_empty() && !action.is_empty() => Ok(()),
        _ => Err(CoreError::invalid(format!(
            "event type '{event_type}' must have the form category.action"
        ))),
    }
}

/// Endpoint health and administrative state.
///
/// ```text
/// Active ──(failures ≥ threshold)──▶ Suspended ──(success or reactivate)──▶ Active
/// Inactive / Failed: set by operators only
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    /// Eligible for delivery.
    Active,
    /// Disabled by an operator.
    Inactive,
    /// Tripped by the circuit breaker or suspended by an operator.
    Suspended,
    /// Marked broken by an operator.
    Failed,
}

impl EndpointStatus {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for EndpointStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "suspended" => Ok(Self::Suspended),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::invalid(format!("invalid endpoint status: {s}"))),
        }
    }
}

text_column!(EndpointStatus);

/// HTTP methods an endpoint may be called with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP POST (default).
    #[default]
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP PATCH.
    Patch,
}

impl HttpMethod {
    /// Canonical upper-case method name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            _ => Err(CoreError::invalid(format!("unsupported http method: {s}"))),
        }
    }
}

text_column!(HttpMethod);

/// Whether an endpoint may be called right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointAvailability {
    /// Active, or suspended with an elapsed cooldown (trial call).
    Available,
    /// Suspended until the given instant.
    Suspended {
        /// End of the cooldown window.
        until: DateTime<Utc>,
    },
    /// Inactive or failed by an operator.
    Disabled(EndpointStatus),
}

/// Registered subscriber endpoint.
///
/// Owns its delivery policy and live health counters. The secret is
/// generated once at creation and never changes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    /// Unique identifier.
    pub id: EndpointId,

    /// Owning tenant.
    pub tenant_id: TenantId,

    /// Name, unique within the tenant.
    pub name: String,

    /// Target URL.
    pub url: String,

    /// HMAC signing secret. Never serialized.
    #[serde(skip_serializing, default)]
    pub secret: String,

    /// Request method.
    pub http_method: HttpMethod,

    /// `Content-Type` header sent with every request.
    pub content_type: String,

    /// Extra request headers. Cannot override the signature or event
    /// headers.
    pub custom_headers: Json<HashMap<String, String>>,

    /// Payload predicates narrowing which events are delivered.
    pub filter_conditions: Json<FilterConditions>,

    /// Subscribed event types.
    pub subscribed_events: Vec<String>,

    /// Retries after the first attempt (0..=10).
    pub max_retries: i32,

    /// Backoff base in seconds (1..=3600).
    pub retry_delay_seconds: i32,

    /// Per-request timeout in seconds (5..=300).
    pub timeout_seconds: i32,

    /// Consecutive failures that trip the breaker (1..=100).
    pub failure_threshold: i32,

    /// Health state.
    pub status: EndpointStatus,

    /// Failures since the last success.
    pub consecutive_failures: i32,

    /// End of the current suspension window.
    pub suspended_until: Option<DateTime<Utc>>,

    /// Lifetime attempt count.
    pub total_deliveries: i64,

    /// Lifetime success count.
    pub successful_deliveries: i64,

    /// Lifetime failure count.
    pub failed_deliveries: i64,

    /// Time of the last attempt.
    pub last_delivery_at: Option<DateTime<Utc>>,

    /// Time of the last success.
    pub last_success_at: Option<DateTime<Utc>>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last configuration change.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Default `max_retries` for new endpoints.
    pub const DEFAULT_MAX_RETRIES: i32 = 3;
    /// Default `retry_delay_seconds` for new endpoints.
    pub const DEFAULT_RETRY_DELAY_SECONDS: i32 = 60;
    /// Default `timeout_seconds` for new endpoints.
    pub const DEFAULT_TIMEOUT_SECONDS: i32 = 30;
    /// Default `failure_threshold` for new endpoints.
    pub const DEFAULT_FAILURE_THRESHOLD: i32 = 5;

    /// Creates an active endpoint with default delivery policy.
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EndpointId::new(),
            tenant_id,
            name: name.into(),
            url: url.into(),
            secret: secret.into(),
            http_method: HttpMethod::Post,
            content_type: "application/json".to_string(),
            custom_headers: Json(HashMap::new()),
            filter_conditions: Json(FilterConditions::new()),
            subscribed_events: Vec::new(),
            max_retries: Self::DEFAULT_MAX_RETRIES,
            retry_delay_seconds: Self::DEFAULT_RETRY_DELAY_SECONDS,
            timeout_seconds: Self::DEFAULT_TIMEOUT_SECONDS,
            failure_threshold: Self::DEFAULT_FAILURE_THRESHOLD,
            status: EndpointStatus::Active,
            consecutive_failures: 0,
            suspended_until: None,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_delivery_at: None,
            last_success_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Subscribes to the given event types.
    #[must_use]
    pub fn subscribed_to<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribed_events = event_types.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the filter conditions.
    #[must_use]
    pub fn with_filter(mut self, filter: FilterConditions) -> Self {
        self.filter_conditions = Json(filter);
        self
    }

    /// Total attempts a new delivery to this endpoint is allowed.
    pub fn max_attempts(&self) -> i32 {
        self.max_retries + 1
    }

    /// Returns true if subscribed to `event_type`.
    pub fn is_subscribed(&self, event_type: &str) -> bool {
        self.subscribed_events.iter().any(|subscribed| subscribed == event_type)
    }

    /// Returns true if the payload passes this endpoint's filter.
    pub fn accepts_payload(&self, payload: &Value) -> bool {
        self.filter_conditions.0.matches(payload)
    }

    /// Decides whether a delivery may call this endpoint at `now`.
    pub fn availability(&self, now: DateTime<Utc>) -> EndpointAvailability {
        match self.status {
            EndpointStatus::Active => EndpointAvailability::Available,
            EndpointStatus::Suspended => match self.suspended_until {
                Some(until) if until > now => EndpointAvailability::Suspended { until },
                _ => EndpointAvailability::Available,
            },
            status => EndpointAvailability::Disabled(status),
        }
    }

    /// Fraction of attempts that succeeded, `None` before the first attempt.
    pub fn success_rate(&self) -> Option<f64> {
        ratio(self.successful_deliveries, self.total_deliveries)
    }

    /// Checks policy ranges and the event subscription identifiers.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::invalid("name must not be empty"));
        }
        check_range("max_retries", self.max_retries, MAX_RETRIES_RANGE)?;
        check_range("retry_delay_seconds", self.retry_delay_seconds, RETRY_DELAY_RANGE)?;
        check_range("timeout_seconds", self.timeout_seconds, TIMEOUT_RANGE)?;
        check_range("failure_threshold", self.failure_threshold, FAILURE_THRESHOLD_RANGE)?;
        for event_type in &self.subscribed_events {
            validate_event_type(event_type)?;
        }
        Ok(())
    }
}

fn check_range(field: &str, value: i32, (min, max): (i32, i32)) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::invalid(format!("{field} must be between {min} and {max}, got {value}")))
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: i64, denominator: i64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Health fields returned by the atomic breaker updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct EndpointHealth {
    /// Status after the update.
    pub status: EndpointStatus,
    /// Consecutive failures after the update.
    pub consecutive_failures: i32,
    /// Suspension window after the update.
    pub suspended_until: Option<DateTime<Utc>>,
}

/// Weak provenance reference to the domain object that raised an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Kind of object, e.g. `inventory_item`.
    pub kind: String,
    /// Identifier of the object, opaque to courier.
    pub id: String,
}

impl SourceRef {
    /// Creates a source reference.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into() }
    }
}

/// Append-only audit record of one dispatched event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    /// Identifier shared with every delivery of this occurrence.
    pub event_id: EventId,
    /// Tenant the event was raised in.
    pub tenant_id: TenantId,
    /// Catalog event type.
    pub event_type: String,
    /// Event payload as given by the producer.
    pub payload: Value,
    /// Originating domain object, if any.
    pub source: Option<SourceRef>,
    /// Deliveries created by fan-out.
    pub endpoints_notified: i32,
    /// Deliveries that succeeded.
    pub successful_deliveries: i32,
    /// Deliveries that failed terminally.
    pub failed_deliveries: i32,
    /// Fan-out completed.
    pub is_processed: bool,
    /// When fan-out completed.
    pub processed_at: Option<DateTime<Utc>>,
    /// When the event was raised.
    pub created_at: DateTime<Utc>,
}

impl EventLog {
    /// Creates an unprocessed occurrence.
    pub fn new(
        event_id: EventId,
        tenant_id: TenantId,
        event_type: impl Into<String>,
        payload: Value,
        source: Option<SourceRef>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            event_type: event_type.into(),
            payload,
            source,
            endpoints_notified: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            is_processed: false,
            processed_at: None,
            created_at: now,
        }
    }

    /// Fraction of notified endpoints that received the event.
    pub fn success_rate(&self) -> Option<f64> {
        ratio(i64::from(self.successful_deliveries), i64::from(self.endpoints_notified))
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventLog {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let payload: Json<Value> = row.try_get("payload")?;
        let source_kind: Option<String> = row.try_get("source_kind")?;
        let source_id: Option<String> = row.try_get("source_id")?;

        Ok(Self {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_type: row.try_get("event_type")?,
            payload: payload.0,
            source: source_kind.zip(source_id).map(|(kind, id)| SourceRef { kind, id }),
            endpoints_notified: row.try_get("endpoints_notified")?,
            successful_deliveries: row.try_get("successful_deliveries")?,
            failed_deliveries: row.try_get("failed_deliveries")?,
            is_processed: row.try_get("is_processed")?,
            processed_at: row.try_get("processed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Delivery lifecycle.
///
/// ```text
/// Pending ──claim──▶ Sending ──2xx──▶ Success
///    ▲                  └──error──▶ Failed ──attempts remain, due──┐
///    └─────────────────────────────────────────────────────────────┘
/// Pending ──endpoint disabled──▶ Cancelled
/// Sending ──claim expired──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker, request in flight.
    Sending,
    /// Subscriber answered 2xx.
    Success,
    /// Last attempt failed.
    Failed,
    /// Abandoned without a network call.
    Cancelled,
}

impl DeliveryStatus {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(CoreError::invalid(format!("invalid delivery status: {s}"))),
        }
    }
}

text_column!(DeliveryStatus);

/// One subscriber's copy of an event occurrence and its latest attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    /// Unique identifier, sent as `X-Webhook-Delivery`.
    pub id: DeliveryId,
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Tenant of the endpoint.
    pub tenant_id: TenantId,
    /// Occurrence this delivery belongs to.
    pub event_id: EventId,
    /// Catalog event type.
    pub event_type: String,
    /// Payload snapshot taken at dispatch.
    pub payload: Json<Value>,
    /// Lifecycle state.
    pub status: DeliveryStatus,
    /// 1-based attempt counter.
    pub attempt_number: i32,
    /// Frozen at creation from the endpoint's `max_retries + 1`.
    pub max_attempts: i32,
    /// When the delivery is next due.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Headers of the last request.
    pub request_headers: Option<Json<HashMap<String, String>>>,
    /// Body of the last request.
    pub request_body: Option<String>,
    /// Status code of the last response.
    pub response_status: Option<i32>,
    /// Headers of the last response.
    pub response_headers: Option<Json<HashMap<String, String>>>,
    /// Body of the last response, truncated.
    pub response_body: Option<String>,
    /// Duration of the last request in milliseconds.
    pub duration_ms: Option<i64>,
    /// Classified error code of the last failure.
    pub error_code: Option<String>,
    /// Human-readable error of the last failure.
    pub error_message: Option<String>,
    /// When the last attempt was sent.
    pub sent_at: Option<DateTime<Utc>>,
    /// When the last attempt resolved.
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    /// Creates the first pending attempt for `endpoint`, due immediately.
    pub fn new(endpoint: &Endpoint, event: &EventLog, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            endpoint_id: endpoint.id,
            tenant_id: endpoint.tenant_id,
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            payload: Json(event.payload.clone()),
            status: DeliveryStatus::Pending,
            attempt_number: 1,
            max_attempts: endpoint.max_attempts(),
            next_retry_at: Some(now),
            request_headers: None,
            request_body: None,
            response_status: None,
            response_headers: None,
            response_body: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
            sent_at: None,
            completed_at: None,
            created_at: now,
        }
    }

    /// Marks the delivery claimed at `at`, for callers that attempt it
    /// themselves rather than leaving it to the workers.
    #[must_use]
    pub fn claimed(mut self, at: DateTime<Utc>) -> Self {
        self.status = DeliveryStatus::Sending;
        self.sent_at = Some(at);
        self
    }

    /// Attempts left after the current one.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt_number < self.max_attempts
    }

    /// Failed with attempts remaining.
    pub fn is_retry_eligible(&self) -> bool {
        self.status == DeliveryStatus::Failed && self.has_attempts_remaining()
    }

    /// No further automatic attempts will happen.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            DeliveryStatus::Success | DeliveryStatus::Cancelled => true,
            DeliveryStatus::Failed => !self.has_attempts_remaining(),
            DeliveryStatus::Pending | DeliveryStatus::Sending => false,
        }
    }
}

/// Result of one attempt, written back to the delivery row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    /// `Success`, `Failed` or `Cancelled`.
    pub status: DeliveryStatus,
    /// Headers sent.
    pub request_headers: Option<HashMap<String, String>>,
    /// Body sent.
    pub request_body: Option<String>,
    /// Response status code.
    pub response_status: Option<i32>,
    /// Response headers.
    pub response_headers: Option<HashMap<String, String>>,
    /// Response body, truncated.
    pub response_body: Option<String>,
    /// Request duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Classified error code.
    pub error_code: Option<String>,
    /// Error detail.
    pub error_message: Option<String>,
    /// Next due time when attempts remain.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Resolution time.
    pub completed_at: DateTime<Utc>,
}

impl DeliveryOutcome {
    /// Outcome that never reached the network.
    pub fn rejected(
        status: DeliveryStatus,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            request_headers: None,
            request_body: None,
            response_status: None,
            response_headers: None,
            response_body: None,
            duration_ms: None,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
            next_retry_at: None,
            completed_at,
        }
    }

    /// Sets the next due time.
    #[must_use]
    pub fn retry_at(mut self, next_retry_at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = next_retry_at;
        self
    }
}

/// Filters for listing deliveries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryQuery {
    /// Restrict to one endpoint.
    pub endpoint_id: Option<EndpointId>,
    /// Restrict to one occurrence.
    pub event_id: Option<EventId>,
    /// Restrict to one status.
    pub status: Option<DeliveryStatus>,
    /// Page size.
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

/// Filters for listing event logs of a tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLogQuery {
    /// Restrict to one event type.
    pub event_type: Option<String>,
    /// Page size.
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: i64 = 50;
/// Largest accepted page size.
pub const MAX_PAGE_SIZE: i64 = 500;

/// Clamps an optional page size to `1..=MAX_PAGE_SIZE`.
pub fn page_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Clamps an optional page offset to be non-negative.
pub fn page_offset(offset: Option<i64>) -> i64 {
    offset.unwrap_or(0).max(0)
}

/// Adds a whole number of minutes to `now`, saturating on overflow.
pub fn minutes_from(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    now.checked_add_signed(Duration::minutes(minutes)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::filter::FilterCondition;

    fn endpoint() -> Endpoint {
        Endpoint::new(TenantId::new(), "orders", "https://example.com/hook", "whsec_x", Utc::now())
    }

    #[test]
    fn event_type_requires_separator() {
        assert!(EventDefinition::new("user.created", "User created", EventCategory::User).is_ok());
        assert!(EventDefinition::new("usercreated", "bad", EventCategory::User).is_err());
        assert!(EventDefinition::new(".created", "bad", EventCategory::User).is_err());
        assert!(EventDefinition::new("user.", "bad", EventCategory::User).is_err());
    }

    #[test]
    fn definition_prefix_is_category_part() {
        let def = EventDefinition::new("inventory.low_stock", "Low stock", EventCategory::Inventory)
            .unwrap();
        assert_eq!(def.prefix(), "inventory");
    }

    #[test]
    fn max_attempts_is_retries_plus_one() {
        let mut ep = endpoint();
        ep.max_retries = 2;
        assert_eq!(ep.max_attempts(), 3);
    }

    #[test]
    fn validate_enforces_policy_ranges() {
        let mut ep = endpoint();
        assert!(ep.validate().is_ok());

        ep.max_retries = 11;
        assert!(ep.validate().is_err());

        ep = endpoint();
        ep.retry_delay_seconds = 0;
        assert!(ep.validate().is_err());

        ep = endpoint();
        ep.timeout_seconds = 4;
        assert!(ep.validate().is_err());

        ep = endpoint();
        ep.failure_threshold = 101;
        assert!(ep.validate().is_err());

        ep = endpoint().subscribed_to(["nodot"]);
        assert!(ep.validate().is_err());
    }

    #[test]
    fn availability_follows_status_and_cooldown() {
        let now = Utc::now();
        let mut ep = endpoint();
        assert_eq!(ep.availability(now), EndpointAvailability::Available);

        ep.status = EndpointStatus::Suspended;
        ep.suspended_until = Some(now + Duration::minutes(5));
        assert!(matches!(ep.availability(now), EndpointAvailability::Suspended { .. }));

        ep.suspended_until = Some(now - Duration::seconds(1));
        assert_eq!(ep.availability(now), EndpointAvailability::Available);

        ep.status = EndpointStatus::Inactive;
        assert_eq!(
            ep.availability(now),
            EndpointAvailability::Disabled(EndpointStatus::Inactive)
        );
    }

    #[test]
    fn new_delivery_is_pending_first_attempt_due_now() {
        let now = Utc::now();
        let mut ep = endpoint();
        ep.max_retries = 4;
        let log =
            EventLog::new(EventId::new(), ep.tenant_id, "user.created", json!({"id": 1}), None, now);

        let delivery = Delivery::new(&ep, &log, now);

        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt_number, 1);
        assert_eq!(delivery.max_attempts, 5);
        assert_eq!(delivery.next_retry_at, Some(now));
        assert_eq!(delivery.event_id, log.event_id);
    }

    #[test]
    fn terminal_failed_only_when_exhausted() {
        let now = Utc::now();
        let ep = endpoint();
        let log = EventLog::new(EventId::new(), ep.tenant_id, "user.created", json!({}), None, now);
        let mut delivery = Delivery::new(&ep, &log, now);

        delivery.status = DeliveryStatus::Failed;
        assert!(delivery.is_retry_eligible());
        assert!(!delivery.is_terminal());

        delivery.attempt_number = delivery.max_attempts;
        assert!(!delivery.is_retry_eligible());
        assert!(delivery.is_terminal());
    }

    #[test]
    fn success_rates_handle_zero_denominator() {
        let mut ep = endpoint();
        assert_eq!(ep.success_rate(), None);

        ep.total_deliveries = 4;
        ep.successful_deliveries = 3;
        assert_eq!(ep.success_rate(), Some(0.75));

        let mut log =
            EventLog::new(EventId::new(), ep.tenant_id, "user.created", json!({}), None, Utc::now());
        assert_eq!(log.success_rate(), None);
        log.endpoints_notified = 2;
        log.successful_deliveries = 1;
        assert_eq!(log.success_rate(), Some(0.5));
    }

    #[test]
    fn endpoint_filter_is_applied() {
        let ep = endpoint()
            .with_filter(FilterConditions::new().with("quantity", FilterCondition::equals(10)));
        assert!(!ep.accepts_payload(&json!({"item_code": "X1", "quantity": 2})));
        assert!(ep.accepts_payload(&json!({"item_code": "X1", "quantity": 10})));
    }

    #[test]
    fn secret_is_never_serialized() {
        let ep = endpoint();
        let value = serde_json::to_value(&ep).unwrap();
        assert!(value.get("secret").is_none());
    }

    #[test]
    fn status_text_round_trips() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Sending,
            DeliveryStatus::Success,
            DeliveryStatus::Failed,
            DeliveryStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
        }
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("GET".parse::<HttpMethod>().is_err());
    }
}

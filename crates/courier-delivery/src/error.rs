//! Error types for webhook delivery operations.
//!
//! Every failure an attempt can end in maps to a stable error code that is
//! persisted on the delivery row and shown to operators.

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while dispatching or delivering webhooks.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection refused, reset or DNS failure.
    #[error("connection failed: {message}")]
    Network {
        /// Transport error detail.
        message: String,
    },

    /// The request exceeded the endpoint's timeout.
    #[error("request timed out after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout in seconds.
        timeout_seconds: u64,
    },

    /// The request could not be built or sent.
    #[error("request failed: {message}")]
    Request {
        /// Error detail.
        message: String,
    },

    /// The subscriber answered outside the 2xx range.
    #[error("subscriber responded with HTTP {status_code}")]
    HttpStatus {
        /// Response status code.
        status_code: u16,
    },

    /// The endpoint is suspended by the circuit breaker.
    #[error("endpoint suspended until {until}")]
    EndpointSuspended {
        /// End of the cooldown window.
        until: chrono::DateTime<chrono::Utc>,
    },

    /// The endpoint was disabled by an operator or no longer exists.
    #[error("endpoint {endpoint_id} is not accepting deliveries")]
    EndpointInactive {
        /// Endpoint identifier.
        endpoint_id: String,
    },

    /// Persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),

    /// Invalid client or engine configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Error detail.
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured shutdown timeout.
        timeout: std::time::Duration,
    },

    /// Anything else.
    #[error("unexpected delivery error: {message}")]
    Internal {
        /// Error detail.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a request error.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Code persisted in `Delivery::error_code`.
    pub fn code(&self) -> String {
        match self {
            Self::Network { .. } => "CONNECTION_ERROR".to_string(),
            Self::Timeout { .. } => "TIMEOUT".to_string(),
            Self::Request { .. } => "REQUEST_ERROR".to_string(),
            Self::HttpStatus { status_code } => format!("HTTP_{status_code}"),
            Self::EndpointSuspended { .. } => "ENDPOINT_SUSPENDED".to_string(),
            Self::EndpointInactive { .. } => "ENDPOINT_INACTIVE".to_string(),
            Self::Storage(_)
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Internal { .. } => "UNEXPECTED_ERROR".to_string(),
        }
    }

    /// Whether the delivery may be attempted again, attempts permitting.
    ///
    /// Transport failures and every non-2xx status are retryable; 4xx and 5xx
    /// are not distinguished.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::Request { .. }
            | Self::HttpStatus { .. }
            | Self::EndpointSuspended { .. }
            | Self::Internal { .. } => true,
            Self::EndpointInactive { .. }
            | Self::Storage(_)
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout { timeout_seconds: 0 }
        } else if error.is_connect() {
            Self::network(error.to_string())
        } else if error.is_builder() || error.is_request() || error.is_redirect() {
            Self::request(error.to_string())
        } else {
            Self::internal(error.to_string())
        }
    }
}

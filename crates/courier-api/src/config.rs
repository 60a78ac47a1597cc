//! Service configuration.

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use courier_delivery::{CircuitConfig, ClientConfig, DeliveryConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Environment variable names are the upper-cased field names, e.g.
/// `DELIVERY_WORKER_COUNT` or `SUSPENSION_COOLDOWN_MINUTES`.
///
/// # Example
///
/// ```no_run
/// use courier_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("Server will bind to {}", config.server_addr);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    // Server
    /// Administrative API bind address.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Per-request timeout of the administrative API in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    // Workers
    /// Number of concurrent delivery workers.
    #[serde(default = "default_worker_count")]
    pub delivery_worker_count: usize,
    /// Idle sleep between worker cycles in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub delivery_poll_interval_ms: u64,
    /// How long shutdown waits for in-flight deliveries.
    #[serde(default = "default_shutdown_timeout")]
    pub delivery_shutdown_timeout_seconds: u64,
    /// Seconds past the endpoint timeout after which a claimed delivery
    /// without an outcome is released.
    #[serde(default = "default_claim_grace")]
    pub delivery_claim_grace_seconds: u64,

    // Batches
    /// Pending deliveries processed per cycle.
    #[serde(default = "default_pending_batch_size")]
    pub pending_batch_size: usize,
    /// Failed deliveries retried per cycle.
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: usize,

    // Circuit breaker
    /// Suspension window after an endpoint trips its breaker.
    #[serde(default = "default_cooldown_minutes")]
    pub suspension_cooldown_minutes: u64,

    // HTTP client
    /// User agent sent with every webhook.
    #[serde(default = "default_user_agent")]
    pub client_user_agent: String,
    /// Redirects followed per webhook.
    #[serde(default = "default_max_redirects")]
    pub client_max_redirects: u32,
    /// Whether subscriber TLS certificates are verified.
    #[serde(default = "default_verify_tls")]
    pub client_verify_tls: bool,

    // Logging
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Config {
    /// Loads configuration from defaults, `courier.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("")),
        )
    }

    /// Extracts and validates configuration from `figment`.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Delivery engine and worker configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.delivery_worker_count,
            pending_batch_size: self.pending_batch_size,
            retry_batch_size: self.retry_batch_size,
            poll_interval: Duration::from_millis(self.delivery_poll_interval_ms),
            shutdown_timeout: Duration::from_secs(self.delivery_shutdown_timeout_seconds),
            claim_grace: Duration::from_secs(self.delivery_claim_grace_seconds),
            circuit: self.to_circuit_config(),
            client: self.to_client_config(),
        }
    }

    /// Webhook HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            user_agent: self.client_user_agent.clone(),
            max_redirects: self.client_max_redirects,
            verify_tls: self.client_verify_tls,
            ..ClientConfig::default()
        }
    }

    /// Circuit breaker configuration.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig { cooldown: Duration::from_secs(self.suspension_cooldown_minutes * 60) }
    }

    /// Parses the server socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if `server_addr` is not `host:port`.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        self.server_addr.parse().context("invalid server address")
    }

    /// Whether logs should be emitted as JSON.
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                if colon_pos > self.database_url.find("://").map_or(0, |i| i + 2) {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("database_url must not be empty");
        }
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }
        if self.delivery_worker_count == 0 {
            anyhow::bail!("delivery_worker_count must be greater than 0");
        }
        if self.pending_batch_size == 0 {
            anyhow::bail!("pending_batch_size must be greater than 0");
        }
        if self.retry_batch_size == 0 {
            anyhow::bail!("retry_batch_size must be greater than 0");
        }
        if self.suspension_cooldown_minutes == 0 {
            anyhow::bail!("suspension_cooldown_minutes must be greater than 0");
        }
        if !matches!(self.log_format.to_ascii_lowercase().as_str(), "text" | "json") {
            anyhow::bail!("log_format must be 'text' or 'json'");
        }
        self.parse_server_addr()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            server_addr: default_server_addr(),
            request_timeout_seconds: default_request_timeout(),
            delivery_worker_count: default_worker_count(),
            delivery_poll_interval_ms: default_poll_interval_ms(),
            delivery_shutdown_timeout_seconds: default_shutdown_timeout(),
            delivery_claim_grace_seconds: default_claim_grace(),
            pending_batch_size: default_pending_batch_size(),
            retry_batch_size: default_retry_batch_size(),
            suspension_cooldown_minutes: default_cooldown_minutes(),
            client_user_agent: default_user_agent(),
            client_max_redirects: default_max_redirects(),
            client_verify_tls: default_verify_tls(),
            log_format: default_log_format(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_server_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_worker_count() -> usize {
    courier_delivery::DEFAULT_WORKER_COUNT
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_claim_grace() -> u64 {
    60
}

fn default_pending_batch_size() -> usize {
    courier_delivery::engine::DEFAULT_PENDING_BATCH_SIZE
}

fn default_retry_batch_size() -> usize {
    courier_delivery::engine::DEFAULT_RETRY_BATCH_SIZE
}

fn default_cooldown_minutes() -> u64 {
    60
}

fn default_user_agent() -> String {
    ClientConfig::default().user_agent
}

fn default_max_redirects() -> u32 {
    3
}

fn default_verify_tls() -> bool {
    true
}

fn default_log_format() -> String {
    "text".to_string()
}

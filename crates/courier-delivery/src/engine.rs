//! Delivery engine: claims pending deliveries, sends them and records the
//! outcome.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  claim   ┌────────────────┐  send   ┌─────────────┐
//! │ Worker Pool  │────────▶ │ DeliveryEngine │───────▶ │ Subscriber  │
//! └──────────────┘          └────────────────┘         └─────────────┘
//!                              │          │
//!                 outcome,     ▼          ▼  notifications
//!                 health  ┌─────────┐  ┌──────────────┐
//!                         │ Storage │  │ EventHandler │
//!                         └─────────┘  └──────────────┘
//! ```
//!
//! Every status change goes through a compare-and-set in storage, so any
//! number of engines may share one database. `deliver` never recurses into a
//! retry: it persists `next_retry_at` and leaves the next attempt to
//! [`DeliveryEngine::retry_failed`].

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    Clock, Delivery, DeliveryEvent, DeliveryFailedEvent, DeliveryId, DeliveryOutcome,
    DeliveryStatus, DeliverySucceededEvent, Endpoint, EndpointSuspendedEvent, EventHandler,
    NoOpEventHandler,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    circuit::{Admission, CircuitBreaker, CircuitConfig, Transition},
    client::{ClientConfig, DeliveryClient, WebhookRequest, WebhookResponse},
    error::{DeliveryError, Result},
    retry::{RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Default number of pending deliveries one cycle processes.
pub const DEFAULT_PENDING_BATCH_SIZE: usize = 100;
/// Default number of failed deliveries one cycle retries.
pub const DEFAULT_RETRY_BATCH_SIZE: usize = 50;
/// Default slack past the endpoint timeout before a claim counts as stale.
pub const DEFAULT_CLAIM_GRACE: Duration = Duration::from_secs(60);

/// Configuration for the delivery engine and its workers.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,
    /// Cap on pending deliveries per cycle.
    pub pending_batch_size: usize,
    /// Cap on failed deliveries retried per cycle.
    pub retry_batch_size: usize,
    /// How long an idle worker sleeps between cycles.
    pub poll_interval: Duration,
    /// Maximum time to wait for workers on shutdown.
    pub shutdown_timeout: Duration,
    /// Time past the endpoint timeout after which a `sending` delivery is
    /// considered abandoned.
    pub claim_grace: Duration,
    /// Circuit breaker settings.
    pub circuit: CircuitConfig,
    /// HTTP client configuration.
    pub client: ClientConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            pending_batch_size: DEFAULT_PENDING_BATCH_SIZE,
            retry_batch_size: DEFAULT_RETRY_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            claim_grace: DEFAULT_CLAIM_GRACE,
            circuit: CircuitConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// Counters since startup, for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    /// Deliveries claimed.
    pub claimed: u64,
    /// Claims lost to another worker.
    pub claims_lost: u64,
    /// Attempts answered with 2xx.
    pub succeeded: u64,
    /// Failed attempts, short-circuited ones included.
    pub failed: u64,
    /// Deliveries cancelled because the endpoint was disabled.
    pub cancelled: u64,
    /// Abandoned claims released by stale-claim recovery.
    pub recovered: u64,
}

/// Sends claimed deliveries and applies retry and circuit breaker policy.
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    client: DeliveryClient,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("breaker", &self.breaker)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Creates an engine that reports to no observers.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = DeliveryClient::new(&config.client)?;
        Ok(Self {
            storage,
            client,
            breaker: CircuitBreaker::new(config.circuit),
            clock,
            event_handler: Arc::new(NoOpEventHandler),
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
        })
    }

    /// Reports delivery lifecycle notifications to `handler`.
    #[must_use]
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Current counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Delivers up to `batch_size` due pending deliveries, oldest first.
    ///
    /// Returns the number of deliveries processed without an internal error.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the due deliveries cannot be listed. Errors on
    /// individual deliveries are logged and skipped.
    pub async fn process_pending(&self, batch_size: usize) -> Result<usize> {
        let due = self.storage.find_due_pending(self.clock.now_utc(), batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "processing pending deliveries");

        let mut processed = 0;
        for delivery_id in due {
            match self.deliver(delivery_id).await {
                Ok(_) => processed += 1,
                Err(e) => error!(%delivery_id, error = %e, "delivery processing failed"),
            }
        }
        Ok(processed)
    }

    /// Requeues and immediately attempts up to `batch_size` due failed
    /// deliveries.
    ///
    /// This is the only path that advances `attempt_number`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the due deliveries cannot be listed.
    pub async fn retry_failed(&self, batch_size: usize) -> Result<usize> {
        let now = self.clock.now_utc();
        let due = self.storage.find_due_failed(now, batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "retrying failed deliveries");

        let mut processed = 0;
        for delivery_id in due {
            let requeued = match self.storage.requeue_delivery(delivery_id, now).await {
                Ok(requeued) => requeued,
                Err(e) => {
                    error!(%delivery_id, error = %e, "failed to requeue delivery");
                    continue;
                },
            };
            let Some(delivery) = requeued else {
                debug!(%delivery_id, "delivery no longer retry-eligible, skipping");
                continue;
            };

            debug!(%delivery_id, attempt = delivery.attempt_number, "delivery requeued");
            match self.deliver(delivery_id).await {
                Ok(_) => processed += 1,
                Err(e) => error!(%delivery_id, error = %e, "delivery processing failed"),
            }
        }
        Ok(processed)
    }

    /// Fails up to `batch_size` deliveries abandoned in `sending`.
    ///
    /// A claim is abandoned once `sent_at` is older than the endpoint timeout
    /// plus `claim_grace`, which happens when a worker stops between claim
    /// and outcome. Deliveries with attempts left become due for
    /// [`retry_failed`](Self::retry_failed); the rest fail terminally.
    /// Endpoint stats are left alone since the attempt's result is unknown.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on persistence failure.
    pub async fn recover_stale_claims(&self, batch_size: usize) -> Result<usize> {
        let error =
            DeliveryError::internal("delivery attempt abandoned before its outcome was recorded");
        let outcome = DeliveryOutcome::rejected(
            DeliveryStatus::Failed,
            error.code(),
            error.to_string(),
            self.clock.now_utc(),
        );
        let released =
            self.storage.fail_stale_claims(outcome, self.config.claim_grace, batch_size).await?;

        for delivery in &released {
            if delivery.next_retry_at.is_some() {
                warn!(
                    delivery_id = %delivery.id,
                    endpoint_id = %delivery.endpoint_id,
                    attempt = delivery.attempt_number,
                    "abandoned delivery claim released for retry"
                );
            } else {
                self.storage.record_event_outcome(delivery.event_id, false).await?;
                warn!(
                    delivery_id = %delivery.id,
                    endpoint_id = %delivery.endpoint_id,
                    attempt = delivery.attempt_number,
                    "abandoned delivery claim released, no attempts left"
                );
            }
        }

        if !released.is_empty() {
            self.stats.write().await.recovered += u64::try_from(released.len()).unwrap_or(u64::MAX);
        }
        Ok(released.len())
    }

    /// Makes a retry-eligible failed delivery due now.
    ///
    /// The next [`retry_failed`](Self::retry_failed) cycle performs the
    /// attempt. Returns `None` for deliveries that are not failed or have no
    /// attempts left.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on persistence failure.
    pub async fn schedule_retry(&self, delivery_id: DeliveryId) -> Result<Option<Delivery>> {
        let delivery = self.storage.mark_delivery_due(delivery_id, self.clock.now_utc()).await?;
        if delivery.is_some() {
            info!(%delivery_id, "manual retry scheduled");
        }
        Ok(delivery)
    }

    /// Attempts one pending delivery.
    ///
    /// Returns true only when the subscriber answered 2xx. A delivery another
    /// worker already claimed is skipped and returns false.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when an outcome cannot be persisted. Subscriber
    /// failures are recorded on the delivery, not returned.
    pub async fn deliver(&self, delivery_id: DeliveryId) -> Result<bool> {
        let now = self.clock.now_utc();
        let Some(delivery) = self.storage.claim_delivery(delivery_id, now).await? else {
            debug!(%delivery_id, "claim lost, skipping");
            self.stats.write().await.claims_lost += 1;
            return Ok(false);
        };
        self.stats.write().await.claimed += 1;
        self.attempt_claimed(delivery, now).await
    }

    /// Attempts a delivery the caller recorded already claimed, as
    /// [`Delivery::claimed`] does for the endpoint test action.
    ///
    /// Workers never pick up such a delivery, so the caller owns the attempt.
    /// Returns false without sending if `delivery` is not in `sending`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the outcome cannot be persisted.
    pub async fn deliver_claimed(&self, delivery: Delivery) -> Result<bool> {
        if delivery.status != DeliveryStatus::Sending {
            debug!(
                delivery_id = %delivery.id,
                status = %delivery.status,
                "delivery not claimed, skipping"
            );
            return Ok(false);
        }
        self.stats.write().await.claimed += 1;
        self.attempt_claimed(delivery, self.clock.now_utc()).await
    }

    async fn attempt_claimed(&self, delivery: Delivery, now: DateTime<Utc>) -> Result<bool> {
        let delivery_id = delivery.id;
        let Some(endpoint) = self.storage.find_endpoint(delivery.endpoint_id).await? else {
            self.cancel(&delivery, "endpoint no longer exists").await?;
            return Ok(false);
        };

        match self.breaker.admit(&endpoint, now) {
            Admission::Reject(status) => {
                self.cancel(&delivery, &format!("endpoint is {status}")).await?;
                Ok(false)
            },
            Admission::ShortCircuit { until } => {
                let outcome = attempt_record(None, None, None, now);
                self.fail(&endpoint, &delivery, DeliveryError::EndpointSuspended { until }, outcome)
                    .await?;
                Ok(false)
            },
            Admission::Allow { trial } => {
                if trial {
                    info!(endpoint_id = %endpoint.id, %delivery_id, "cooldown elapsed, sending trial delivery");
                }
                self.attempt(&endpoint, &delivery).await
            },
        }
    }

    async fn attempt(&self, endpoint: &Endpoint, delivery: &Delivery) -> Result<bool> {
        let request = match WebhookRequest::build(endpoint, delivery, self.clock.now_utc()) {
            Ok(request) => request,
            Err(e) => {
                let outcome = attempt_record(None, None, None, self.clock.now_utc());
                self.fail(endpoint, delivery, e, outcome).await?;
                return Ok(false);
            },
        };

        let started = self.clock.now();
        let result = self.client.send(&request).await;
        let elapsed = self.clock.now().saturating_duration_since(started);
        let duration_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        let finished_at = self.clock.now_utc();

        match result {
            Ok(response) if response.is_success() => {
                let outcome =
                    attempt_record(Some(&request), Some(&response), Some(duration_ms), finished_at);
                self.succeed(endpoint, delivery, response.status_code, outcome).await
            },
            Ok(response) => {
                let outcome =
                    attempt_record(Some(&request), Some(&response), Some(duration_ms), finished_at);
                let error = DeliveryError::HttpStatus { status_code: response.status_code };
                self.fail(endpoint, delivery, error, outcome).await?;
                Ok(false)
            },
            Err(error) => {
                let outcome = attempt_record(Some(&request), None, Some(duration_ms), finished_at);
                self.fail(endpoint, delivery, error, outcome).await?;
                Ok(false)
            },
        }
    }

    async fn succeed(
        &self,
        endpoint: &Endpoint,
        delivery: &Delivery,
        status_code: u16,
        outcome: DeliveryOutcome,
    ) -> Result<bool> {
        let at = outcome.completed_at;
        if !self.storage.complete_delivery(delivery.id, outcome).await? {
            debug!(delivery_id = %delivery.id, "delivery already resolved");
            return Ok(false);
        }
        self.stats.write().await.succeeded += 1;

        if let Some(health) = self.storage.record_endpoint_success(endpoint.id, at).await? {
            if CircuitBreaker::after_success(endpoint.status, &health) == Transition::Reactivated {
                info!(endpoint_id = %endpoint.id, "endpoint reactivated after successful delivery");
            }
        }
        self.storage.record_event_outcome(delivery.event_id, true).await?;

        info!(
            delivery_id = %delivery.id,
            endpoint_id = %endpoint.id,
            event_type = %delivery.event_type,
            attempt = delivery.attempt_number,
            status = status_code,
            "webhook delivered"
        );
        self.notify(DeliveryEvent::Succeeded(DeliverySucceededEvent {
            delivery_id: delivery.id,
            event_id: delivery.event_id,
            tenant_id: delivery.tenant_id,
            endpoint_id: endpoint.id,
            response_status: status_code,
            attempt_number: delivery.attempt_number,
            delivered_at: at,
        }))
        .await;
        Ok(true)
    }

    async fn fail(
        &self,
        endpoint: &Endpoint,
        delivery: &Delivery,
        error: DeliveryError,
        mut outcome: DeliveryOutcome,
    ) -> Result<()> {
        let now = outcome.completed_at;

        // Short-circuited attempts count but never extend the cooldown.
        let (trip_until, mut suspended_until) = match &error {
            DeliveryError::EndpointSuspended { until } => (None, Some(*until)),
            _ => (Some(self.breaker.trip_until(now)), None),
        };

        if let Some(health) =
            self.storage.record_endpoint_failure(endpoint.id, now, trip_until).await?
        {
            if let Transition::Tripped { until } = CircuitBreaker::after_failure(trip_until, &health)
            {
                warn!(
                    endpoint_id = %endpoint.id,
                    consecutive_failures = health.consecutive_failures,
                    suspended_until = %until,
                    "endpoint suspended after consecutive failures"
                );
                suspended_until = Some(until);
                self.notify(DeliveryEvent::EndpointSuspended(EndpointSuspendedEvent {
                    endpoint_id: endpoint.id,
                    tenant_id: endpoint.tenant_id,
                    consecutive_failures: health.consecutive_failures,
                    suspended_until: until,
                }))
                .await;
            }
        }

        let decision = if error.is_retryable() {
            RetryPolicy::for_delivery(endpoint, delivery).decide(delivery.attempt_number, now)
        } else {
            RetryDecision::GiveUp
        };
        let next_retry_at = match decision {
            RetryDecision::Retry { next_attempt_at } => {
                Some(suspended_until.map_or(next_attempt_at, |until| next_attempt_at.max(until)))
            },
            RetryDecision::GiveUp => None,
        };

        outcome.status = DeliveryStatus::Failed;
        outcome.error_code = Some(error.code());
        outcome.error_message = Some(error.to_string());
        outcome.next_retry_at = next_retry_at;

        if !self.storage.complete_delivery(delivery.id, outcome).await? {
            debug!(delivery_id = %delivery.id, "delivery already resolved");
            return Ok(());
        }
        self.stats.write().await.failed += 1;

        match next_retry_at {
            Some(next_retry_at) => warn!(
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                attempt = delivery.attempt_number,
                error_code = %error.code(),
                %next_retry_at,
                error = %error,
                "delivery failed, retry scheduled"
            ),
            None => {
                self.storage.record_event_outcome(delivery.event_id, false).await?;
                warn!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    attempt = delivery.attempt_number,
                    error_code = %error.code(),
                    error = %error,
                    "delivery permanently failed"
                );
            },
        }

        self.notify(DeliveryEvent::Failed(DeliveryFailedEvent {
            delivery_id: delivery.id,
            event_id: delivery.event_id,
            tenant_id: delivery.tenant_id,
            endpoint_id: endpoint.id,
            error_code: error.code(),
            error_message: error.to_string(),
            attempt_number: delivery.attempt_number,
            next_retry_at,
            failed_at: now,
        }))
        .await;
        Ok(())
    }

    async fn cancel(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let error = DeliveryError::EndpointInactive { endpoint_id: delivery.endpoint_id.to_string() };
        let outcome = DeliveryOutcome::rejected(
            DeliveryStatus::Cancelled,
            error.code(),
            format!("{error}: {reason}"),
            self.clock.now_utc(),
        );
        if self.storage.complete_delivery(delivery.id, outcome).await? {
            self.stats.write().await.cancelled += 1;
            info!(
                delivery_id = %delivery.id,
                endpoint_id = %delivery.endpoint_id,
                reason,
                "delivery cancelled"
            );
        }
        Ok(())
    }

    async fn notify(&self, event: DeliveryEvent) {
        self.event_handler.handle_event(event).await;
    }
}

/// Attempt snapshot without status or error fields.
fn attempt_record(
    request: Option<&WebhookRequest>,
    response: Option<&WebhookResponse>,
    duration_ms: Option<i64>,
    completed_at: DateTime<Utc>,
) -> DeliveryOutcome {
    DeliveryOutcome {
        status: DeliveryStatus::Success,
        request_headers: request.map(|r| r.headers.clone()),
        request_body: request.map(WebhookRequest::body_text),
        response_status: response.map(|r| i32::from(r.status_code)),
        response_headers: response.map(|r| r.headers.clone()),
        response_body: response.map(|r| r.body.clone()),
        duration_ms,
        error_code: None,
        error_message: None,
        next_retry_at: None,
        completed_at,
    }
}

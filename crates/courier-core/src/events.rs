//! Delivery lifecycle notifications for in-process observers.
//!
//! The delivery engine reports outcomes through an [`EventHandler`] so that
//! metrics, alerting or audit components can react without the engine
//! knowing about them:
//!
//! ```text
//! DeliveryEngine ──DeliveryEvent──▶ MulticastEventHandler ──▶ observer A
//!                                                         └──▶ observer B
//! ```
//!
//! Handlers must not fail the delivery. They log their own errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DeliveryId, EndpointId, EventId, TenantId};

/// Notifications emitted by the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// A subscriber acknowledged a delivery with 2xx.
    Succeeded(DeliverySucceededEvent),

    /// An attempt failed.
    Failed(DeliveryFailedEvent),

    /// The circuit breaker suspended an endpoint.
    EndpointSuspended(EndpointSuspendedEvent),
}

/// Emitted after a successful attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Delivery that succeeded.
    pub delivery_id: DeliveryId,
    /// Occurrence the delivery belongs to.
    pub event_id: EventId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Receiving endpoint.
    pub endpoint_id: EndpointId,
    /// Subscriber status code.
    pub response_status: u16,
    /// Attempt that succeeded, 1-based.
    pub attempt_number: i32,
    /// Completion time.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted after a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Delivery that failed.
    pub delivery_id: DeliveryId,
    /// Occurrence the delivery belongs to.
    pub event_id: EventId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Classified error code, e.g. `HTTP_503` or `TIMEOUT`.
    pub error_code: String,
    /// Error detail.
    pub error_message: String,
    /// Attempt that failed, 1-based.
    pub attempt_number: i32,
    /// Next due time, `None` when attempts are exhausted.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Failure time.
    pub failed_at: DateTime<Utc>,
}

/// Emitted when consecutive failures reach the endpoint's threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSuspendedEvent {
    /// Suspended endpoint.
    pub endpoint_id: EndpointId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Failure count that tripped the breaker.
    pub consecutive_failures: i32,
    /// End of the cooldown window.
    pub suspended_until: DateTime<Utc>,
}

/// Observer of delivery lifecycle notifications.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one notification. Must not block for long.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Handler that discards every notification.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards each notification to every registered observer concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no observers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registers an observer.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered observers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });
        futures::future::join_all(deliveries).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn suspended_event() -> DeliveryEvent {
        DeliveryEvent::EndpointSuspended(EndpointSuspendedEvent {
            endpoint_id: EndpointId::new(),
            tenant_id: TenantId::new(),
            consecutive_failures: 5,
            suspended_until: Utc::now(),
        })
    }

    #[tokio::test]
    async fn multicast_reaches_every_subscriber() {
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());
        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(first.clone());
        multicast.add_subscriber(second.clone());

        multicast.handle_event(suspended_event()).await;

        assert_eq!(multicast.subscriber_count(), 2);
        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_multicast_and_noop_accept_events() {
        MulticastEventHandler::new().handle_event(suspended_event()).await;
        NoOpEventHandler::new().handle_event(suspended_event()).await;
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let value = serde_json::to_value(suspended_event()).unwrap();
        assert_eq!(value["kind"], "endpoint_suspended");
        assert_eq!(value["consecutive_failures"], 5);
    }
}

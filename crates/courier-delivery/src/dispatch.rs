//! Event dispatch: fans one domain event out into per-endpoint deliveries.
//!
//! Dispatch makes no network calls. It resolves the event type against the
//! catalog, selects active subscribed endpoints whose filters accept the
//! payload, and writes the occurrence together with its deliveries in one
//! transaction. Workers pick the deliveries up afterwards.

use std::sync::Arc;

use courier_core::{
    Clock, Delivery, DeliveryId, Endpoint, EventId, EventLog, SourceRef, TenantId,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{error::Result, storage::DeliveryStorage};

/// What a dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Unknown or inactive event type; nothing was written.
    Ignored,
    /// The occurrence was recorded with one delivery per matching endpoint.
    Dispatched {
        /// Created deliveries, possibly none.
        deliveries: Vec<DeliveryId>,
    },
}

/// Turns fired domain events into pending deliveries.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over `storage`.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Fire-and-forget entry point for producers.
    ///
    /// Always returns a fresh event id. Unknown or inactive event types and
    /// internal failures are logged and otherwise ignored.
    pub async fn dispatch_event(
        &self,
        event_type: &str,
        payload: Value,
        tenant_id: TenantId,
        source: Option<SourceRef>,
    ) -> EventId {
        let event_id = EventId::new();
        match self.try_dispatch(event_id, event_type, payload, tenant_id, source).await {
            Ok(DispatchOutcome::Ignored) => {
                warn!(%event_id, event_type, %tenant_id, "unknown or inactive event type, ignoring");
            },
            Ok(DispatchOutcome::Dispatched { deliveries }) => {
                info!(
                    %event_id,
                    event_type,
                    %tenant_id,
                    endpoints_notified = deliveries.len(),
                    "event dispatched"
                );
            },
            Err(e) => {
                error!(%event_id, event_type, %tenant_id, error = %e, "event dispatch failed");
            },
        }
        event_id
    }

    /// Dispatches under a caller-chosen id and reports what happened.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the catalog or endpoints cannot be read or the
    /// occurrence cannot be written. Nothing is persisted in that case.
    pub async fn try_dispatch(
        &self,
        event_id: EventId,
        event_type: &str,
        payload: Value,
        tenant_id: TenantId,
        source: Option<SourceRef>,
    ) -> Result<DispatchOutcome> {
        let definition = self.storage.find_event_definition(event_type.to_string()).await?;
        if !definition.is_some_and(|d| d.is_active) {
            return Ok(DispatchOutcome::Ignored);
        }

        let now = self.clock.now_utc();
        let log = EventLog::new(event_id, tenant_id, event_type, payload, source, now);

        let candidates =
            self.storage.find_dispatch_targets(tenant_id, event_type.to_string()).await?;
        let deliveries: Vec<Delivery> = candidates
            .iter()
            .filter(|endpoint| {
                let accepted = endpoint.accepts_payload(&log.payload);
                if !accepted {
                    debug!(%event_id, endpoint_id = %endpoint.id, "filtered out by endpoint conditions");
                }
                accepted
            })
            .map(|endpoint| Delivery::new(endpoint, &log, now))
            .collect();

        let ids = deliveries.iter().map(|d| d.id).collect();
        self.storage.record_dispatch(log, deliveries, now).await?;
        Ok(DispatchOutcome::Dispatched { deliveries: ids })
    }

    /// Records an occurrence with a single delivery to `endpoint`, bypassing
    /// its subscriptions and filters.
    ///
    /// Backs the endpoint test action. The delivery is written already
    /// claimed, so workers leave it alone and the caller attempts it with
    /// [`DeliveryEngine::deliver_claimed`](crate::DeliveryEngine::deliver_claimed).
    /// The endpoint's status is not checked here; the engine decides at
    /// delivery time.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the occurrence cannot be written.
    pub async fn dispatch_to_endpoint(
        &self,
        endpoint: &Endpoint,
        event_type: &str,
        payload: Value,
    ) -> Result<Delivery> {
        let now = self.clock.now_utc();
        let log = EventLog::new(EventId::new(), endpoint.tenant_id, event_type, payload, None, now);
        let delivery = Delivery::new(endpoint, &log, now).claimed(now);

        self.storage.record_dispatch(log, vec![delivery.clone()], now).await?;
        debug!(
            event_id = %delivery.event_id,
            endpoint_id = %endpoint.id,
            delivery_id = %delivery.id,
            "direct delivery recorded"
        );
        Ok(delivery)
    }
}

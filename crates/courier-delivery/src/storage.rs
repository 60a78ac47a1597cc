//! Storage abstraction layer for dispatch, delivery and administration.
//!
//! Production code uses [`PostgresDeliveryStorage`] over the repositories in
//! `courier_core::storage`; tests use [`mock::MockDeliveryStorage`], which
//! honours the same compare-and-set semantics in memory.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result, storage::Storage, Delivery, DeliveryId, DeliveryOutcome, DeliveryQuery,
    Endpoint, EndpointHealth, EndpointId, EventDefinition, EventId, EventLog, EventLogQuery,
    TenantId,
};

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the dispatcher, the delivery engine and
/// the administrative API.
///
/// Operations that change delivery status or endpoint health must be atomic
/// in the backing store: concurrent workers rely on them instead of locks.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Verifies the backing store is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;

    /// Inserts or refreshes a catalog entry, keeping its active flag.
    fn upsert_event_definition(&self, definition: EventDefinition) -> StorageFuture<'_, ()>;

    /// Looks up a catalog entry.
    fn find_event_definition(&self, event_type: String)
        -> StorageFuture<'_, Option<EventDefinition>>;

    /// Lists the catalog.
    fn list_event_definitions(&self) -> StorageFuture<'_, Vec<EventDefinition>>;

    /// Activates or deactivates a catalog entry. Returns false if absent.
    fn set_event_definition_active(
        &self,
        event_type: String,
        is_active: bool,
    ) -> StorageFuture<'_, bool>;

    /// Registers an endpoint with its subscriptions.
    ///
    /// Fails with `ConstraintViolation` for a duplicate name in the tenant or
    /// an event type missing from the catalog.
    fn create_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, ()>;

    /// Looks up an endpoint.
    fn find_endpoint(&self, endpoint_id: EndpointId) -> StorageFuture<'_, Option<Endpoint>>;

    /// Lists a tenant's endpoints, oldest first.
    fn list_endpoints(&self, tenant_id: TenantId) -> StorageFuture<'_, Vec<Endpoint>>;

    /// Writes endpoint configuration and subscriptions, leaving health state
    /// and the secret alone.
    fn update_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, ()>;

    /// Deletes an endpoint and its deliveries. Returns false if absent.
    fn delete_endpoint(&self, endpoint_id: EndpointId) -> StorageFuture<'_, bool>;

    /// Suspends an endpoint until `until`. Returns false if absent.
    fn suspend_endpoint(
        &self,
        endpoint_id: EndpointId,
        until: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Reactivates an endpoint and zeroes its failure streak. Returns false
    /// if absent.
    fn reactivate_endpoint(&self, endpoint_id: EndpointId) -> StorageFuture<'_, bool>;

    /// Active endpoints of a tenant subscribed to `event_type`.
    fn find_dispatch_targets(
        &self,
        tenant_id: TenantId,
        event_type: String,
    ) -> StorageFuture<'_, Vec<Endpoint>>;

    /// Atomically counts a success, clears the failure streak and lifts a
    /// suspension.
    fn record_endpoint_success(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<EndpointHealth>>;

    /// Atomically counts a failure; with `trip_until` set, suspends the
    /// endpoint when the streak reaches its threshold. A suspension that has
    /// not elapsed by `at` is never extended.
    fn record_endpoint_failure(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
        trip_until: Option<DateTime<Utc>>,
    ) -> StorageFuture<'_, Option<EndpointHealth>>;

    /// Writes an occurrence, its deliveries and the processed marker in one
    /// transaction.
    fn record_dispatch(
        &self,
        log: EventLog,
        deliveries: Vec<Delivery>,
        processed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Looks up an occurrence.
    fn find_event_log(&self, event_id: EventId) -> StorageFuture<'_, Option<EventLog>>;

    /// Lists a tenant's occurrences, newest first.
    fn list_event_logs(
        &self,
        tenant_id: TenantId,
        query: EventLogQuery,
    ) -> StorageFuture<'_, Vec<EventLog>>;

    /// Counts a resolved delivery against its occurrence.
    fn record_event_outcome(&self, event_id: EventId, succeeded: bool) -> StorageFuture<'_, ()>;

    /// Looks up a delivery.
    fn find_delivery(&self, delivery_id: DeliveryId) -> StorageFuture<'_, Option<Delivery>>;

    /// Lists deliveries, newest first.
    fn list_deliveries(&self, query: DeliveryQuery) -> StorageFuture<'_, Vec<Delivery>>;

    /// Deliveries of one occurrence, oldest first.
    fn find_deliveries_by_event(&self, event_id: EventId) -> StorageFuture<'_, Vec<Delivery>>;

    /// Due pending deliveries, oldest first.
    fn find_due_pending(&self, now: DateTime<Utc>, limit: usize)
        -> StorageFuture<'_, Vec<DeliveryId>>;

    /// Due failed deliveries with attempts left.
    fn find_due_failed(&self, now: DateTime<Utc>, limit: usize)
        -> StorageFuture<'_, Vec<DeliveryId>>;

    /// Compare-and-set `pending → sending`. `None` means another worker won.
    fn claim_delivery(
        &self,
        delivery_id: DeliveryId,
        sent_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Delivery>>;

    /// Writes an attempt outcome. Returns false if the delivery had already
    /// resolved.
    fn complete_delivery(
        &self,
        delivery_id: DeliveryId,
        outcome: DeliveryOutcome,
    ) -> StorageFuture<'_, bool>;

    /// Fails `sending` deliveries whose claim outlived the endpoint timeout
    /// plus `grace`, writing `outcome` with `completed_at` as the current
    /// time.
    ///
    /// Rows with attempts left become due at once. Returns the updated rows.
    fn fail_stale_claims(
        &self,
        outcome: DeliveryOutcome,
        grace: Duration,
        limit: usize,
    ) -> StorageFuture<'_, Vec<Delivery>>;

    /// Compare-and-set `failed → pending` with `attempt_number + 1`.
    fn requeue_delivery(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Delivery>>;

    /// Makes a retry-eligible failed delivery due at `now`.
    fn mark_delivery_due(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Delivery>>;
}

fn batch_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn grace_seconds(grace: Duration) -> i32 {
    i32::try_from(grace.as_secs()).unwrap_or(i32::MAX)
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn health_check(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.health_check().await })
    }

    fn upsert_event_definition(&self, definition: EventDefinition) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.event_definitions.upsert(&definition).await })
    }

    fn find_event_definition(
        &self,
        event_type: String,
    ) -> StorageFuture<'_, Option<EventDefinition>> {
        Box::pin(async move { self.storage.event_definitions.find(&event_type).await })
    }

    fn list_event_definitions(&self) -> StorageFuture<'_, Vec<EventDefinition>> {
        Box::pin(async move { self.storage.event_definitions.list().await })
    }

    fn set_event_definition_active(
        &self,
        event_type: String,
        is_active: bool,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage.event_definitions.set_active(&event_type, is_active).await
        })
    }

    fn create_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.endpoints.create(&endpoint).await })
    }

    fn find_endpoint(&self, endpoint_id: EndpointId) -> StorageFuture<'_, Option<Endpoint>> {
        Box::pin(async move { self.storage.endpoints.find_by_id(endpoint_id).await })
    }

    fn list_endpoints(&self, tenant_id: TenantId) -> StorageFuture<'_, Vec<Endpoint>> {
        Box::pin(async move { self.storage.endpoints.find_by_tenant(tenant_id).await })
    }

    fn update_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.endpoints.update(&endpoint).await })
    }

    fn delete_endpoint(&self, endpoint_id: EndpointId) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.endpoints.delete(endpoint_id).await })
    }

    fn suspend_endpoint(
        &self,
        endpoint_id: EndpointId,
        until: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.endpoints.suspend(endpoint_id, until).await })
    }

    fn reactivate_endpoint(&self, endpoint_id: EndpointId) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.endpoints.reactivate(endpoint_id).await })
    }

    fn find_dispatch_targets(
        &self,
        tenant_id: TenantId,
        event_type: String,
    ) -> StorageFuture<'_, Vec<Endpoint>> {
        Box::pin(async move {
            self.storage.endpoints.find_dispatch_targets(tenant_id, &event_type).await
        })
    }

    fn record_endpoint_success(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<EndpointHealth>> {
        Box::pin(async move { self.storage.endpoints.record_success(endpoint_id, at).await })
    }

    fn record_endpoint_failure(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
        trip_until: Option<DateTime<Utc>>,
    ) -> StorageFuture<'_, Option<EndpointHealth>> {
        Box::pin(async move {
            self.storage.endpoints.record_failure(endpoint_id, at, trip_until).await
        })
    }

    fn record_dispatch(
        &self,
        log: EventLog,
        deliveries: Vec<Delivery>,
        processed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.record_dispatch(&log, &deliveries, processed_at).await })
    }

    fn find_event_log(&self, event_id: EventId) -> StorageFuture<'_, Option<EventLog>> {
        Box::pin(async move { self.storage.event_logs.find_by_id(event_id).await })
    }

    fn list_event_logs(
        &self,
        tenant_id: TenantId,
        query: EventLogQuery,
    ) -> StorageFuture<'_, Vec<EventLog>> {
        Box::pin(async move { self.storage.event_logs.list_by_tenant(tenant_id, &query).await })
    }

    fn record_event_outcome(&self, event_id: EventId, succeeded: bool) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.event_logs.record_outcome(event_id, succeeded).await })
    }

    fn find_delivery(&self, delivery_id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.storage.deliveries.find_by_id(delivery_id).await })
    }

    fn list_deliveries(&self, query: DeliveryQuery) -> StorageFuture<'_, Vec<Delivery>> {
        Box::pin(async move { self.storage.deliveries.list(&query).await })
    }

    fn find_deliveries_by_event(&self, event_id: EventId) -> StorageFuture<'_, Vec<Delivery>> {
        Box::pin(async move { self.storage.deliveries.find_by_event(event_id).await })
    }

    fn find_due_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryId>> {
        Box::pin(async move {
            self.storage.deliveries.find_due_pending(now, batch_limit(limit)).await
        })
    }

    fn find_due_failed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryId>> {
        Box::pin(async move { self.storage.deliveries.find_due_failed(now, batch_limit(limit)).await })
    }

    fn claim_delivery(
        &self,
        delivery_id: DeliveryId,
        sent_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.storage.deliveries.claim(delivery_id, sent_at).await })
    }

    fn complete_delivery(
        &self,
        delivery_id: DeliveryId,
        outcome: DeliveryOutcome,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.deliveries.complete(delivery_id, &outcome).await })
    }

    fn fail_stale_claims(
        &self,
        outcome: DeliveryOutcome,
        grace: Duration,
        limit: usize,
    ) -> StorageFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            self.storage
                .deliveries
                .fail_stale_claims(&outcome, grace_seconds(grace), batch_limit(limit))
                .await
        })
    }

    fn requeue_delivery(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.storage.deliveries.requeue(delivery_id, now).await })
    }

    fn mark_delivery_due(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.storage.deliveries.mark_due(delivery_id, now).await })
    }
}

pub mod mock {
    //! In-memory storage for tests.
    //!
    //! Every operation takes one lock over the whole state, so status and
    //! counter updates are as atomic as their SQL counterparts.

    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::CoreError, models::page_limit, models::page_offset, Delivery, DeliveryId,
        DeliveryOutcome, DeliveryQuery, DeliveryStatus, Endpoint, EndpointHealth, EndpointId,
        EndpointStatus, EventDefinition, EventId, EventLog, EventLogQuery, TenantId,
    };
    use sqlx::types::Json;
    use tokio::sync::RwLock;

    use super::{DeliveryStorage, StorageFuture};

    #[derive(Debug, Default)]
    struct State {
        definitions: HashMap<String, EventDefinition>,
        endpoints: Vec<Endpoint>,
        event_logs: Vec<EventLog>,
        deliveries: Vec<Delivery>,
        dispatch_error: Option<String>,
        healthy: bool,
    }

    impl State {
        fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
            self.endpoints.iter_mut().find(|e| e.id == id)
        }

        fn delivery_mut(&mut self, id: DeliveryId) -> Option<&mut Delivery> {
            self.deliveries.iter_mut().find(|d| d.id == id)
        }

        fn check_subscriptions(&self, endpoint: &Endpoint) -> courier_core::Result<()> {
            match endpoint.subscribed_events.iter().find(|t| !self.definitions.contains_key(*t)) {
                Some(unknown) => Err(CoreError::ConstraintViolation(format!(
                    "unknown event type: {unknown}"
                ))),
                None => Ok(()),
            }
        }
    }

    fn health(endpoint: &Endpoint) -> EndpointHealth {
        EndpointHealth {
            status: endpoint.status,
            consecutive_failures: endpoint.consecutive_failures,
            suspended_until: endpoint.suspended_until,
        }
    }

    fn sorted(mut event_types: Vec<String>) -> Vec<String> {
        event_types.sort();
        event_types.dedup();
        event_types
    }

    /// In-memory [`DeliveryStorage`] with failure injection.
    #[derive(Debug, Clone)]
    pub struct MockDeliveryStorage {
        state: Arc<RwLock<State>>,
    }

    impl MockDeliveryStorage {
        /// Creates an empty, healthy store.
        pub fn new() -> Self {
            Self { state: Arc::new(RwLock::new(State { healthy: true, ..State::default() })) }
        }

        /// Creates a store seeded with `definitions`.
        pub async fn with_catalog(definitions: impl IntoIterator<Item = EventDefinition>) -> Self {
            let storage = Self::new();
            {
                let mut state = storage.state.write().await;
                for definition in definitions {
                    state.definitions.insert(definition.event_type.clone(), definition);
                }
            }
            storage
        }

        /// Fails the next `record_dispatch` with `message`.
        pub async fn inject_dispatch_error(&self, message: impl Into<String>) {
            self.state.write().await.dispatch_error = Some(message.into());
        }

        /// Makes `health_check` fail until called again with `true`.
        pub async fn set_healthy(&self, healthy: bool) {
            self.state.write().await.healthy = healthy;
        }

        /// All stored deliveries in insertion order.
        pub async fn deliveries(&self) -> Vec<Delivery> {
            self.state.read().await.deliveries.clone()
        }

        /// All stored occurrences in insertion order.
        pub async fn event_logs(&self) -> Vec<EventLog> {
            self.state.read().await.event_logs.clone()
        }

        /// Overwrites a stored delivery, for arranging test state.
        pub async fn put_delivery(&self, delivery: Delivery) {
            let mut state = self.state.write().await;
            match state.delivery_mut(delivery.id) {
                Some(existing) => *existing = delivery,
                None => state.deliveries.push(delivery),
            }
        }

        /// Overwrites a stored endpoint including health state.
        pub async fn put_endpoint(&self, endpoint: Endpoint) {
            let mut state = self.state.write().await;
            match state.endpoint_mut(endpoint.id) {
                Some(existing) => *existing = endpoint,
                None => state.endpoints.push(endpoint),
            }
        }
    }

    impl Default for MockDeliveryStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if self.state.read().await.healthy {
                    Ok(())
                } else {
                    Err(CoreError::Database("mock storage unavailable".to_string()))
                }
            })
        }

        fn upsert_event_definition(&self, definition: EventDefinition) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let is_active = state
                    .definitions
                    .get(&definition.event_type)
                    .map_or(definition.is_active, |existing| existing.is_active);
                state
                    .definitions
                    .insert(definition.event_type.clone(), EventDefinition { is_active, ..definition });
                Ok(())
            })
        }

        fn find_event_definition(
            &self,
            event_type: String,
        ) -> StorageFuture<'_, Option<EventDefinition>> {
            Box::pin(async move { Ok(self.state.read().await.definitions.get(&event_type).cloned()) })
        }

        fn list_event_definitions(&self) -> StorageFuture<'_, Vec<EventDefinition>> {
            Box::pin(async move {
                let mut definitions: Vec<_> =
                    self.state.read().await.definitions.values().cloned().collect();
                definitions.sort_by(|a, b| a.event_type.cmp(&b.event_type));
                Ok(definitions)
            })
        }

        fn set_event_definition_active(
            &self,
            event_type: String,
            is_active: bool,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Ok(state
                    .definitions
                    .get_mut(&event_type)
                    .map(|definition| definition.is_active = is_active)
                    .is_some())
            })
        }

        fn create_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state
                    .endpoints
                    .iter()
                    .any(|e| e.tenant_id == endpoint.tenant_id && e.name == endpoint.name)
                {
                    return Err(CoreError::ConstraintViolation(format!(
                        "endpoint name already exists: {}",
                        endpoint.name
                    )));
                }
                state.check_subscriptions(&endpoint)?;
                let subscribed_events = sorted(endpoint.subscribed_events.clone());
                state.endpoints.push(Endpoint { subscribed_events, ..endpoint });
                Ok(())
            })
        }

        fn find_endpoint(&self, endpoint_id: EndpointId) -> StorageFuture<'_, Option<Endpoint>> {
            Box::pin(async move {
                Ok(self.state.read().await.endpoints.iter().find(|e| e.id == endpoint_id).cloned())
            })
        }

        fn list_endpoints(&self, tenant_id: TenantId) -> StorageFuture<'_, Vec<Endpoint>> {
            Box::pin(async move {
                Ok(self
                    .state
                    .read()
                    .await
                    .endpoints
                    .iter()
                    .filter(|e| e.tenant_id == tenant_id)
                    .cloned()
                    .collect())
            })
        }

        fn update_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state.endpoints.iter().any(|e| {
                    e.id != endpoint.id
                        && e.tenant_id == endpoint.tenant_id
                        && e.name == endpoint.name
                }) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "endpoint name already exists: {}",
                        endpoint.name
                    )));
                }
                state.check_subscriptions(&endpoint)?;
                if let Some(existing) = state.endpoint_mut(endpoint.id) {
                    existing.name = endpoint.name;
                    existing.url = endpoint.url;
                    existing.http_method = endpoint.http_method;
                    existing.content_type = endpoint.content_type;
                    existing.custom_headers = endpoint.custom_headers;
                    existing.filter_conditions = endpoint.filter_conditions;
                    existing.subscribed_events = sorted(endpoint.subscribed_events);
                    existing.max_retries = endpoint.max_retries;
                    existing.retry_delay_seconds = endpoint.retry_delay_seconds;
                    existing.timeout_seconds = endpoint.timeout_seconds;
                    existing.failure_threshold = endpoint.failure_threshold;
                    existing.status = endpoint.status;
                    existing.updated_at = endpoint.updated_at;
                }
                Ok(())
            })
        }

        fn delete_endpoint(&self, endpoint_id: EndpointId) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let before = state.endpoints.len();
                state.endpoints.retain(|e| e.id != endpoint_id);
                state.deliveries.retain(|d| d.endpoint_id != endpoint_id);
                Ok(state.endpoints.len() < before)
            })
        }

        fn suspend_endpoint(
            &self,
            endpoint_id: EndpointId,
            until: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Ok(state
                    .endpoint_mut(endpoint_id)
                    .map(|e| {
                        e.status = EndpointStatus::Suspended;
                        e.suspended_until = Some(until);
                    })
                    .is_some())
            })
        }

        fn reactivate_endpoint(&self, endpoint_id: EndpointId) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Ok(state
                    .endpoint_mut(endpoint_id)
                    .map(|e| {
                        e.status = EndpointStatus::Active;
                        e.consecutive_failures = 0;
                        e.suspended_until = None;
                    })
                    .is_some())
            })
        }

        fn find_dispatch_targets(
            &self,
            tenant_id: TenantId,
            event_type: String,
        ) -> StorageFuture<'_, Vec<Endpoint>> {
            Box::pin(async move {
                Ok(self
                    .state
                    .read()
                    .await
                    .endpoints
                    .iter()
                    .filter(|e| {
                        e.tenant_id == tenant_id
                            && e.status == EndpointStatus::Active
                            && e.is_subscribed(&event_type)
                    })
                    .cloned()
                    .collect())
            })
        }

        fn record_endpoint_success(
            &self,
            endpoint_id: EndpointId,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<EndpointHealth>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Ok(state.endpoint_mut(endpoint_id).map(|e| {
                    e.total_deliveries += 1;
                    e.successful_deliveries += 1;
                    e.consecutive_failures = 0;
                    e.last_delivery_at = Some(at);
                    e.last_success_at = Some(at);
                    if e.status == EndpointStatus::Suspended {
                        e.status = EndpointStatus::Active;
                        e.suspended_until = None;
                    }
                    health(e)
                }))
            })
        }

        fn record_endpoint_failure(
            &self,
            endpoint_id: EndpointId,
            at: DateTime<Utc>,
            trip_until: Option<DateTime<Utc>>,
        ) -> StorageFuture<'_, Option<EndpointHealth>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Ok(state.endpoint_mut(endpoint_id).map(|e| {
                    let trippable = match e.status {
                        EndpointStatus::Active => true,
                        EndpointStatus::Suspended => {
                            e.suspended_until.is_none_or(|until| until <= at)
                        },
                        EndpointStatus::Inactive | EndpointStatus::Failed => false,
                    };
                    let trips = trip_until.is_some()
                        && trippable
                        && e.consecutive_failures + 1 >= e.failure_threshold;
                    e.total_deliveries += 1;
                    e.failed_deliveries += 1;
                    e.consecutive_failures += 1;
                    e.last_delivery_at = Some(at);
                    if trips {
                        e.status = EndpointStatus::Suspended;
                        e.suspended_until = trip_until;
                    }
                    health(e)
                }))
            })
        }

        fn record_dispatch(
            &self,
            log: EventLog,
            deliveries: Vec<Delivery>,
            processed_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(message) = state.dispatch_error.take() {
                    return Err(CoreError::Database(message));
                }
                let notified = i32::try_from(deliveries.len()).unwrap_or(i32::MAX);
                state.event_logs.push(EventLog {
                    endpoints_notified: notified,
                    is_processed: true,
                    processed_at: Some(processed_at),
                    ..log
                });
                state.deliveries.extend(deliveries);
                Ok(())
            })
        }

        fn find_event_log(&self, event_id: EventId) -> StorageFuture<'_, Option<EventLog>> {
            Box::pin(async move {
                Ok(self.state.read().await.event_logs.iter().find(|l| l.event_id == event_id).cloned())
            })
        }

        fn list_event_logs(
            &self,
            tenant_id: TenantId,
            query: EventLogQuery,
        ) -> StorageFuture<'_, Vec<EventLog>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let offset = usize::try_from(page_offset(query.offset)).unwrap_or(usize::MAX);
                let limit = usize::try_from(page_limit(query.limit)).unwrap_or(usize::MAX);
                Ok(state
                    .event_logs
                    .iter()
                    .rev()
                    .filter(|l| l.tenant_id == tenant_id)
                    .filter(|l| query.event_type.as_ref().is_none_or(|t| &l.event_type == t))
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect())
            })
        }

        fn record_event_outcome(
            &self,
            event_id: EventId,
            succeeded: bool,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(log) = state.event_logs.iter_mut().find(|l| l.event_id == event_id) {
                    if succeeded {
                        log.successful_deliveries += 1;
                    } else {
                        log.failed_deliveries += 1;
                    }
                }
                Ok(())
            })
        }

        fn find_delivery(&self, delivery_id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
            Box::pin(async move {
                Ok(self.state.read().await.deliveries.iter().find(|d| d.id == delivery_id).cloned())
            })
        }

        fn list_deliveries(&self, query: DeliveryQuery) -> StorageFuture<'_, Vec<Delivery>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let offset = usize::try_from(page_offset(query.offset)).unwrap_or(usize::MAX);
                let limit = usize::try_from(page_limit(query.limit)).unwrap_or(usize::MAX);
                Ok(state
                    .deliveries
                    .iter()
                    .rev()
                    .filter(|d| query.endpoint_id.is_none_or(|id| d.endpoint_id == id))
                    .filter(|d| query.event_id.is_none_or(|id| d.event_id == id))
                    .filter(|d| query.status.is_none_or(|s| d.status == s))
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect())
            })
        }

        fn find_deliveries_by_event(
            &self,
            event_id: EventId,
        ) -> StorageFuture<'_, Vec<Delivery>> {
            Box::pin(async move {
                Ok(self
                    .state
                    .read()
                    .await
                    .deliveries
                    .iter()
                    .filter(|d| d.event_id == event_id)
                    .cloned()
                    .collect())
            })
        }

        fn find_due_pending(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryId>> {
            Box::pin(async move {
                Ok(self
                    .state
                    .read()
                    .await
                    .deliveries
                    .iter()
                    .filter(|d| d.status == DeliveryStatus::Pending)
                    .filter(|d| d.next_retry_at.is_none_or(|at| at <= now))
                    .take(limit)
                    .map(|d| d.id)
                    .collect())
            })
        }

        fn find_due_failed(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryId>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let mut due: Vec<&Delivery> = state
                    .deliveries
                    .iter()
                    .filter(|d| d.is_retry_eligible())
                    .filter(|d| d.next_retry_at.is_some_and(|at| at <= now))
                    .collect();
                due.sort_by_key(|d| d.next_retry_at);
                Ok(due.into_iter().take(limit).map(|d| d.id).collect())
            })
        }

        fn claim_delivery(
            &self,
            delivery_id: DeliveryId,
            sent_at: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<Delivery>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Ok(state
                    .delivery_mut(delivery_id)
                    .filter(|d| d.status == DeliveryStatus::Pending)
                    .map(|d| {
                        d.status = DeliveryStatus::Sending;
                        d.sent_at = Some(sent_at);
                        d.clone()
                    }))
            })
        }

        fn complete_delivery(
            &self,
            delivery_id: DeliveryId,
            outcome: DeliveryOutcome,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let Some(delivery) = state.delivery_mut(delivery_id).filter(|d| {
                    matches!(d.status, DeliveryStatus::Pending | DeliveryStatus::Sending)
                }) else {
                    return Ok(false);
                };
                delivery.status = outcome.status;
                delivery.request_headers = outcome.request_headers.map(Json);
                delivery.request_body = outcome.request_body;
                delivery.response_status = outcome.response_status;
                delivery.response_headers = outcome.response_headers.map(Json);
                delivery.response_body = outcome.response_body;
                delivery.duration_ms = outcome.duration_ms;
                delivery.error_code = outcome.error_code;
                delivery.error_message = outcome.error_message;
                delivery.next_retry_at = outcome.next_retry_at;
                delivery.completed_at = Some(outcome.completed_at);
                Ok(true)
            })
        }

        fn fail_stale_claims(
            &self,
            outcome: DeliveryOutcome,
            grace: Duration,
            limit: usize,
        ) -> StorageFuture<'_, Vec<Delivery>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let now = outcome.completed_at;
                let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);

                let mut stale: Vec<(DateTime<Utc>, DeliveryId)> = state
                    .deliveries
                    .iter()
                    .filter(|d| d.status == DeliveryStatus::Sending)
                    .filter_map(|d| {
                        let endpoint = state.endpoints.iter().find(|e| e.id == d.endpoint_id)?;
                        let sent_at = d.sent_at?;
                        let timeout =
                            chrono::Duration::seconds(i64::from(endpoint.timeout_seconds));
                        let expires = sent_at.checked_add_signed(timeout.checked_add(&grace)?)?;
                        (expires <= now).then_some((sent_at, d.id))
                    })
                    .collect();
                stale.sort_by_key(|(sent_at, _)| *sent_at);

                let mut released = Vec::new();
                for (_, id) in stale.into_iter().take(limit) {
                    if let Some(d) = state.delivery_mut(id) {
                        d.status = DeliveryStatus::Failed;
                        d.error_code.clone_from(&outcome.error_code);
                        d.error_message.clone_from(&outcome.error_message);
                        d.next_retry_at = d.has_attempts_remaining().then_some(now);
                        d.completed_at = Some(now);
                        released.push(d.clone());
                    }
                }
                Ok(released)
            })
        }

        fn requeue_delivery(
            &self,
            delivery_id: DeliveryId,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<Delivery>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Ok(state.delivery_mut(delivery_id).filter(|d| d.is_retry_eligible()).map(|d| {
                    d.status = DeliveryStatus::Pending;
                    d.attempt_number += 1;
                    d.next_retry_at = Some(now);
                    d.error_code = None;
                    d.error_message = None;
                    d.clone()
                }))
            })
        }

        fn mark_delivery_due(
            &self,
            delivery_id: DeliveryId,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<Delivery>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Ok(state.delivery_mut(delivery_id).filter(|d| d.is_retry_eligible()).map(|d| {
                    d.next_retry_at = Some(now);
                    d.clone()
                }))
            })
        }
    }
}

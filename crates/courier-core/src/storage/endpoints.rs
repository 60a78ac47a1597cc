//! Repository for endpoint registry operations.
//!
//! Endpoints carry both configuration and live health state. Configuration
//! is written by the administrative API; health counters and breaker state
//! are only ever changed by single-statement increments so concurrent
//! workers never lose updates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Endpoint, EndpointHealth, EndpointId, TenantId},
};

/// Builds an endpoint query, aggregating subscriptions into an array.
macro_rules! select_endpoints {
    ($tail:literal) => {
        concat!(
            r"
            SELECT e.id, e.tenant_id, e.name, e.url, e.secret, e.http_method, e.content_type,
                   e.custom_headers, e.filter_conditions,
                   ARRAY(
                       SELECT s.event_type FROM endpoint_subscriptions s
                       WHERE s.endpoint_id = e.id
                       ORDER BY s.event_type
                   ) AS subscribed_events,
                   e.max_retries, e.retry_delay_seconds, e.timeout_seconds,
                   e.failure_threshold, e.status, e.consecutive_failures, e.suspended_until,
                   e.total_deliveries, e.successful_deliveries, e.failed_deliveries,
                   e.last_delivery_at, e.last_success_at, e.created_at, e.updated_at
            FROM endpoints e
            ",
            $tail
        )
    };
}

/// Repository for endpoint database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts an endpoint and its subscriptions atomically.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` when the name is taken within the tenant
    /// or a subscribed event type is not in the catalog.
    pub async fn create(&self, endpoint: &Endpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.create_in_tx(&mut tx, endpoint).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Inserts an endpoint and its subscriptions within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if an insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        endpoint: &Endpoint,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO endpoints (
                id, tenant_id, name, url, secret, http_method, content_type,
                custom_headers, filter_conditions, max_retries, retry_delay_seconds,
                timeout_seconds, failure_threshold, status, consecutive_failures,
                suspended_until, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18
            )
            ",
        )
        .bind(endpoint.id)
        .bind(endpoint.tenant_id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(endpoint.http_method)
        .bind(&endpoint.content_type)
        .bind(&endpoint.custom_headers)
        .bind(&endpoint.filter_conditions)
        .bind(endpoint.max_retries)
        .bind(endpoint.retry_delay_seconds)
        .bind(endpoint.timeout_seconds)
        .bind(endpoint.failure_threshold)
        .bind(endpoint.status)
        .bind(endpoint.consecutive_failures)
        .bind(endpoint.suspended_until)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&mut **tx)
        .await?;

        self.replace_subscriptions(&mut *tx, endpoint.id, &endpoint.subscribed_events).await
    }

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, endpoint_id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(select_endpoints!("WHERE e.id = $1"))
            .bind(endpoint_id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(endpoint)
    }

    /// Lists a tenant's endpoints, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_tenant(&self, tenant_id: TenantId) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(select_endpoints!(
            "WHERE e.tenant_id = $1 ORDER BY e.created_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Finds an endpoint by name within a tenant.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_name(&self, tenant_id: TenantId, name: &str) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(select_endpoints!(
            "WHERE e.tenant_id = $1 AND e.name = $2"
        ))
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Active endpoints of a tenant subscribed to `event_type`.
    ///
    /// These are the fan-out candidates; payload filters are applied by the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_dispatch_targets(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(select_endpoints!(
            r"
            WHERE e.tenant_id = $1
              AND e.status = 'active'
              AND EXISTS (
                  SELECT 1 FROM endpoint_subscriptions s
                  WHERE s.endpoint_id = e.id AND s.event_type = $2
              )
            ORDER BY e.created_at ASC
            "
        ))
        .bind(tenant_id)
        .bind(event_type)
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Writes configuration fields and replaces subscriptions.
    ///
    /// Health state and counters are left untouched. The secret is never
    /// rewritten.
    ///
    /// # Errors
    ///
    /// Returns error if update fails or constraints are violated.
    pub async fn update(&self, endpoint: &Endpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            UPDATE endpoints
            SET name = $2, url = $3, http_method = $4, content_type = $5,
                custom_headers = $6, filter_conditions = $7, max_retries = $8,
                retry_delay_seconds = $9, timeout_seconds = $10, failure_threshold = $11,
                status = $12, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(endpoint.id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(endpoint.http_method)
        .bind(&endpoint.content_type)
        .bind(&endpoint.custom_headers)
        .bind(&endpoint.filter_conditions)
        .bind(endpoint.max_retries)
        .bind(endpoint.retry_delay_seconds)
        .bind(endpoint.timeout_seconds)
        .bind(endpoint.failure_threshold)
        .bind(endpoint.status)
        .execute(&mut *tx)
        .await?;

        self.replace_subscriptions(&mut tx, endpoint.id, &endpoint.subscribed_events).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn replace_subscriptions(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        endpoint_id: EndpointId,
        event_types: &[String],
    ) -> Result<()> {
        sqlx::query("DELETE FROM endpoint_subscriptions WHERE endpoint_id = $1")
            .bind(endpoint_id)
            .execute(&mut **tx)
            .await?;

        if !event_types.is_empty() {
            sqlx::query(
                r"
                INSERT INTO endpoint_subscriptions (endpoint_id, event_type)
                SELECT $1, UNNEST($2::TEXT[])
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(endpoint_id)
            .bind(event_types)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Deletes an endpoint; its deliveries cascade.
    ///
    /// Returns false when no row matched.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn delete(&self, endpoint_id: EndpointId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM endpoints WHERE id = $1")
            .bind(endpoint_id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Suspends an endpoint until `until`.
    ///
    /// Returns false when no row matched.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn suspend(&self, endpoint_id: EndpointId, until: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE endpoints
            SET status = 'suspended', suspended_until = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(endpoint_id)
        .bind(until)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reactivates an endpoint and clears its failure streak.
    ///
    /// Returns false when no row matched.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn reactivate(&self, endpoint_id: EndpointId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE endpoints
            SET status = 'active', consecutive_failures = 0, suspended_until = NULL,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(endpoint_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records a successful attempt.
    ///
    /// Zeroes the failure streak and lifts a suspension in the same
    /// statement.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn record_success(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
    ) -> Result<Option<EndpointHealth>> {
        let health = sqlx::query_as::<_, EndpointHealth>(
            r"
            UPDATE endpoints
            SET total_deliveries = total_deliveries + 1,
                successful_deliveries = successful_deliveries + 1,
                consecutive_failures = 0,
                last_delivery_at = $2,
                last_success_at = $2,
                status = CASE WHEN status = 'suspended' THEN 'active' ELSE status END,
                suspended_until = CASE WHEN status = 'suspended' THEN NULL ELSE suspended_until END
            WHERE id = $1
            RETURNING status, consecutive_failures, suspended_until
            ",
        )
        .bind(endpoint_id)
        .bind(at)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(health)
    }

    /// Records a failed attempt.
    ///
    /// With `trip_until` set, an endpoint whose streak reaches
    /// `failure_threshold` is suspended until that instant, provided it is
    /// active or its previous suspension has elapsed by `at`. A suspension
    /// still running is left as is. Without `trip_until` only the counters
    /// move, which is how short-circuited attempts are recorded.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn record_failure(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
        trip_until: Option<DateTime<Utc>>,
    ) -> Result<Option<EndpointHealth>> {
        let health = sqlx::query_as::<_, EndpointHealth>(
            r"
            UPDATE endpoints
            SET total_deliveries = total_deliveries + 1,
                failed_deliveries = failed_deliveries + 1,
                consecutive_failures = consecutive_failures + 1,
                last_delivery_at = $2,
                status = CASE
                    WHEN $3::TIMESTAMPTZ IS NOT NULL
                         AND (status = 'active'
                              OR (status = 'suspended'
                                  AND (suspended_until IS NULL OR suspended_until <= $2)))
                         AND consecutive_failures + 1 >= failure_threshold
                    THEN 'suspended' ELSE status END,
                suspended_until = CASE
                    WHEN $3::TIMESTAMPTZ IS NOT NULL
                         AND (status = 'active'
                              OR (status = 'suspended'
                                  AND (suspended_until IS NULL OR suspended_until <= $2)))
                         AND consecutive_failures + 1 >= failure_threshold
                    THEN $3 ELSE suspended_until END
            WHERE id = $1
            RETURNING status, consecutive_failures, suspended_until
            ",
        )
        .bind(endpoint_id)
        .bind(at)
        .bind(trip_until)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(health)
    }
}

//! Repository for delivery records.
//!
//! Status transitions are compare-and-set updates keyed on the current
//! status, so a delivery is attempted by at most one worker even when
//! several poll the same due set.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{
        page_limit, page_offset, Delivery, DeliveryId, DeliveryOutcome, DeliveryQuery, EventId,
    },
};

const SELECT_DELIVERY: &str = r"
    SELECT id, endpoint_id, tenant_id, event_id, event_type, payload, status,
           attempt_number, max_attempts, next_retry_at, request_headers, request_body,
           response_status, response_headers, response_body, duration_ms,
           error_code, error_message, sent_at, completed_at, created_at
    FROM deliveries
";

const RETURNING_DELIVERY: &str = r"
    RETURNING id, endpoint_id, tenant_id, event_id, event_type, payload, status,
              attempt_number, max_attempts, next_retry_at, request_headers, request_body,
              response_status, response_headers, response_body, duration_ms,
              error_code, error_message, sent_at, completed_at, created_at
";

/// Repository for delivery database operations.
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

    /// Inserts a new delivery within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        delivery: &Delivery,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO deliveries (
                id, endpoint_id, tenant_id, event_id, event_type, payload, status,
                attempt_number, max_attempts, next_retry_at, sent_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            ",
        )
        .bind(delivery.id)
        .bind(delivery.endpoint_id)
        .bind(delivery.tenant_id)
        .bind(delivery.event_id)
        .bind(&delivery.event_type)
        .bind(&delivery.payload)
        .bind(delivery.status)
        .bind(delivery.attempt_number)
        .bind(delivery.max_attempts)
        .bind(delivery.next_retry_at)
        .bind(delivery.sent_at)
        .bind(delivery.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Finds a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, delivery_id: DeliveryId) -> Result<Option<Delivery>> {
        let sql = format!("{SELECT_DELIVERY} WHERE id = $1");
        let delivery = sqlx::query_as::<_, Delivery>(&sql)
            .bind(delivery_id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(delivery)
    }

    /// All deliveries fanned out from one occurrence.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Vec<Delivery>> {
        let sql = format!("{SELECT_DELIVERY} WHERE event_id = $1 ORDER BY created_at ASC");
        let deliveries =
            sqlx::query_as::<_, Delivery>(&sql).bind(event_id).fetch_all(&*self.pool).await?;

        Ok(deliveries)
    }

    /// Lists deliveries matching the query, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self, query: &DeliveryQuery) -> Result<Vec<Delivery>> {
        let sql = format!(
            "{SELECT_DELIVERY}
             WHERE ($1::UUID IS NULL OR endpoint_id = $1)
               AND ($2::UUID IS NULL OR event_id = $2)
               AND ($3::TEXT IS NULL OR status = $3)
             ORDER BY created_at DESC
             LIMIT $4 OFFSET $5"
        );
        let deliveries = sqlx::query_as::<_, Delivery>(&sql)
            .bind(query.endpoint_id)
            .bind(query.event_id)
            .bind(query.status)
            .bind(page_limit(query.limit))
            .bind(page_offset(query.offset))
            .fetch_all(&*self.pool)
            .await?;

        Ok(deliveries)
    }

    /// Pending deliveries due at `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_due_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryId>> {
        let ids = sqlx::query_scalar::<_, DeliveryId>(
            r"
            SELECT id FROM deliveries
            WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY created_at ASC
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }

    /// Failed deliveries with attempts left whose backoff elapsed.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_due_failed(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DeliveryId>> {
        let ids = sqlx::query_scalar::<_, DeliveryId>(
            r"
            SELECT id FROM deliveries
            WHERE status = 'failed'
              AND attempt_number < max_attempts
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }

    /// Moves a pending delivery to `sending`.
    ///
    /// Returns `None` when the delivery is not pending, meaning another
    /// worker claimed it first.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn claim(
        &self,
        delivery_id: DeliveryId,
        sent_at: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let sql = format!(
            "UPDATE deliveries
             SET status = 'sending', sent_at = $2, updated_at = NOW()
             WHERE id = $1 AND status = 'pending'
             {RETURNING_DELIVERY}"
        );
        let delivery = sqlx::query_as::<_, Delivery>(&sql)
            .bind(delivery_id)
            .bind(sent_at)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(delivery)
    }

    /// Fails deliveries left in `sending` longer than their endpoint's
    /// timeout plus `grace_seconds`, as of `outcome.completed_at`.
    ///
    /// Rows with attempts left become due at once; the others fail
    /// terminally. The status guard keeps a late outcome from the original
    /// worker from being overwritten, and vice versa.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn fail_stale_claims(
        &self,
        outcome: &DeliveryOutcome,
        grace_seconds: i32,
        limit: i64,
    ) -> Result<Vec<Delivery>> {
        let sql = format!(
            "UPDATE deliveries
             SET status = 'failed',
                 error_code = $2,
                 error_message = $3,
                 next_retry_at = CASE WHEN attempt_number < max_attempts THEN $1 ELSE NULL END,
                 completed_at = $1,
                 updated_at = NOW()
             WHERE status = 'sending'
               AND id IN (
                   SELECT d.id FROM deliveries d
                   JOIN endpoints e ON e.id = d.endpoint_id
                   WHERE d.status = 'sending'
                     AND d.sent_at <= $1 - make_interval(secs => e.timeout_seconds + $4)
                   ORDER BY d.sent_at ASC
                   LIMIT $5
               )
             {RETURNING_DELIVERY}"
        );
        let deliveries = sqlx::query_as::<_, Delivery>(&sql)
            .bind(outcome.completed_at)
            .bind(outcome.error_code.as_deref())
            .bind(outcome.error_message.as_deref())
            .bind(grace_seconds)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        Ok(deliveries)
    }

    /// Writes an attempt outcome to an in-flight or pending delivery.
    ///
    /// Returns false when the delivery already resolved.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn complete(
        &self,
        delivery_id: DeliveryId,
        outcome: &DeliveryOutcome,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE deliveries
            SET status = $2,
                request_headers = $3,
                request_body = $4,
                response_status = $5,
                response_headers = $6,
                response_body = $7,
                duration_ms = $8,
                error_code = $9,
                error_message = $10,
                next_retry_at = $11,
                completed_at = $12,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'sending')
            ",
        )
        .bind(delivery_id)
        .bind(outcome.status)
        .bind(outcome.request_headers.as_ref().map(Json))
        .bind(outcome.request_body.as_deref())
        .bind(outcome.response_status)
        .bind(outcome.response_headers.as_ref().map(Json))
        .bind(outcome.response_body.as_deref())
        .bind(outcome.duration_ms)
        .bind(outcome.error_code.as_deref())
        .bind(outcome.error_message.as_deref())
        .bind(outcome.next_retry_at)
        .bind(outcome.completed_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns a failed delivery with attempts left to `pending` as the
    /// next attempt.
    ///
    /// Returns `None` when the delivery is no longer retry-eligible.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn requeue(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let sql = format!(
            "UPDATE deliveries
             SET status = 'pending',
                 attempt_number = attempt_number + 1,
                 next_retry_at = $2,
                 error_code = NULL,
                 error_message = NULL,
                 updated_at = NOW()
             WHERE id = $1 AND status = 'failed' AND attempt_number < max_attempts
             {RETURNING_DELIVERY}"
        );
        let delivery = sqlx::query_as::<_, Delivery>(&sql)
            .bind(delivery_id)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(delivery)
    }

    /// Makes a retry-eligible failed delivery due immediately.
    ///
    /// Returns `None` when the delivery is not failed or has no attempts
    /// left.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_due(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let sql = format!(
            "UPDATE deliveries
             SET next_retry_at = $2, updated_at = NOW()
             WHERE id = $1 AND status = 'failed' AND attempt_number < max_attempts
             {RETURNING_DELIVERY}"
        );
        let delivery = sqlx::query_as::<_, Delivery>(&sql)
            .bind(delivery_id)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(delivery)
    }
}

//! Repository for the event occurrence audit log.
//!
//! Rows are inserted once per dispatch and afterwards only their counters
//! change.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{page_limit, page_offset, EventId, EventLog, EventLogQuery, TenantId},
};

/// Repository for event log database operations.
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

    /// Inserts an occurrence within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        log: &EventLog,
    ) -> Result<()> {
        let (source_kind, source_id) =
            log.source.as_ref().map(|s| (s.kind.as_str(), s.id.as_str())).unzip();

        sqlx::query(
            r"
            INSERT INTO event_logs (
                event_id, tenant_id, event_type, payload, source_kind, source_id,
                endpoints_notified, successful_deliveries, failed_deliveries,
                is_processed, processed_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(log.event_id)
        .bind(log.tenant_id)
        .bind(&log.event_type)
        .bind(Json(&log.payload))
        .bind(source_kind)
        .bind(source_id)
        .bind(log.endpoints_notified)
        .bind(log.successful_deliveries)
        .bind(log.failed_deliveries)
        .bind(log.is_processed)
        .bind(log.processed_at)
        .bind(log.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Marks fan-out complete and records how many deliveries it created.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_processed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
        endpoints_notified: i32,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE event_logs
            SET endpoints_notified = $2, is_processed = TRUE, processed_at = $3
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .bind(endpoints_notified)
        .bind(processed_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Finds an occurrence by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<EventLog>> {
        let log = sqlx::query_as::<_, EventLog>(
            r"
            SELECT event_id, tenant_id, event_type, payload, source_kind, source_id,
                   endpoints_notified, successful_deliveries, failed_deliveries,
                   is_processed, processed_at, created_at
            FROM event_logs
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(log)
    }

    /// Lists a tenant's occurrences, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        query: &EventLogQuery,
    ) -> Result<Vec<EventLog>> {
        let logs = sqlx::query_as::<_, EventLog>(
            r"
            SELECT event_id, tenant_id, event_type, payload, source_kind, source_id,
                   endpoints_notified, successful_deliveries, failed_deliveries,
                   is_processed, processed_at, created_at
            FROM event_logs
            WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR event_type = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            ",
        )
        .bind(tenant_id)
        .bind(query.event_type.as_deref())
        .bind(page_limit(query.limit))
        .bind(page_offset(query.offset))
        .fetch_all(&*self.pool)
        .await?;

        Ok(logs)
    }

    /// Counts a delivery that resolved for good against its occurrence.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn record_outcome(&self, event_id: EventId, succeeded: bool) -> Result<()> {
        sqlx::query(
            r"
            UPDATE event_logs
            SET successful_deliveries = successful_deliveries + CASE WHEN $2 THEN 1 ELSE 0 END,
                failed_deliveries = failed_deliveries + CASE WHEN $2 THEN 0 ELSE 1 END
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .bind(succeeded)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}

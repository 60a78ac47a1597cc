//! PostgreSQL persistence for the catalog, endpoints, event logs and
//! deliveries.
//!
//! All database operations go through these repositories. Operations that
//! must be atomic across tables live on [`Storage`] itself.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub mod deliveries;
pub mod endpoints;
pub mod event_definitions;
pub mod event_logs;
pub mod schema;

use crate::{
    error::Result,
    models::{Delivery, EventLog},
};

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Event type catalog.
    pub event_definitions: Arc<event_definitions::Repository>,

    /// Endpoint registry and health counters.
    pub endpoints: Arc<endpoints::Repository>,

    /// Delivery records.
    pub deliveries: Arc<deliveries::Repository>,

    /// Event occurrence audit log.
    pub event_logs: Arc<event_logs::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            event_definitions: Arc::new(event_definitions::Repository::new(pool.clone())),
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            event_logs: Arc::new(event_logs::Repository::new(pool)),
        }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.event_logs.pool()
    }

    /// Verifies database connectivity with `SELECT 1`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool()).await?;

        Ok(())
    }

    /// Persists one fan-out: the occurrence, its deliveries and the
    /// processed marker commit together or not at all.
    ///
    /// # Errors
    ///
    /// Returns error if any statement fails; nothing is written then.
    pub async fn record_dispatch(
        &self,
        log: &EventLog,
        deliveries: &[Delivery],
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        let notified = i32::try_from(deliveries.len()).unwrap_or(i32::MAX);
        let mut tx = self.pool().begin().await?;

        self.event_logs.create_in_tx(&mut tx, log).await?;
        for delivery in deliveries {
            self.deliveries.create_in_tx(&mut tx, delivery).await?;
        }
        self.event_logs.mark_processed_in_tx(&mut tx, log.event_id, notified, processed_at).await?;

        tx.commit().await?;
        tracing::debug!(event_id = %log.event_id, notified, "dispatch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool);
        assert!(Arc::ptr_eq(&storage.pool(), &storage.endpoints.pool()));
    }
}

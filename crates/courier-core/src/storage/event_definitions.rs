//! Repository for the event type catalog.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{error::Result, models::EventDefinition};

/// Repository for event definition database operations.
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

    /// Inserts a definition or refreshes its descriptive fields.
    ///
    /// An existing definition keeps its `is_active` flag so reseeding at
    /// startup never re-enables a type an operator switched off.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, definition: &EventDefinition) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO event_definitions (event_type, name, category, schema, is_system, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_type) DO UPDATE
            SET name = EXCLUDED.name,
                category = EXCLUDED.category,
                schema = EXCLUDED.schema,
                is_system = EXCLUDED.is_system
            ",
        )
        .bind(&definition.event_type)
        .bind(&definition.name)
        .bind(definition.category)
        .bind(&definition.schema)
        .bind(definition.is_system)
        .bind(definition.is_active)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Looks up a definition by event type.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, event_type: &str) -> Result<Option<EventDefinition>> {
        let definition = sqlx::query_as::<_, EventDefinition>(
            r"
            SELECT event_type, name, category, schema, is_system, is_active
            FROM event_definitions
            WHERE event_type = $1
            ",
        )
        .bind(event_type)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(definition)
    }

    /// Lists the catalog ordered by event type.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self) -> Result<Vec<EventDefinition>> {
        let definitions = sqlx::query_as::<_, EventDefinition>(
            r"
            SELECT event_type, name, category, schema, is_system, is_active
            FROM event_definitions
            ORDER BY event_type ASC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(definitions)
    }

    /// Enables or disables a definition. Returns false if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn set_active(&self, event_type: &str, is_active: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE event_definitions SET is_active = $2 WHERE event_type = $1")
                .bind(event_type)
                .bind(is_active)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

//! Idempotent schema setup run at startup.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS event_definitions (
        event_type TEXT PRIMARY KEY CHECK (event_type LIKE '_%._%'),
        name TEXT NOT NULL,
        category TEXT NOT NULL,
        schema JSONB NOT NULL DEFAULT '{}'::JSONB,
        is_system BOOLEAN NOT NULL DEFAULT FALSE,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS endpoints (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        secret TEXT NOT NULL,
        http_method TEXT NOT NULL DEFAULT 'POST',
        content_type TEXT NOT NULL DEFAULT 'application/json',
        custom_headers JSONB NOT NULL DEFAULT '{}'::JSONB,
        filter_conditions JSONB NOT NULL DEFAULT '{}'::JSONB,
        max_retries INTEGER NOT NULL DEFAULT 3 CHECK (max_retries BETWEEN 0 AND 10),
        retry_delay_seconds INTEGER NOT NULL DEFAULT 60
            CHECK (retry_delay_seconds BETWEEN 1 AND 3600),
        timeout_seconds INTEGER NOT NULL DEFAULT 30 CHECK (timeout_seconds BETWEEN 5 AND 300),
        failure_threshold INTEGER NOT NULL DEFAULT 5
            CHECK (failure_threshold BETWEEN 1 AND 100),
        status TEXT NOT NULL DEFAULT 'active',
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        suspended_until TIMESTAMPTZ,
        total_deliveries BIGINT NOT NULL DEFAULT 0,
        successful_deliveries BIGINT NOT NULL DEFAULT 0,
        failed_deliveries BIGINT NOT NULL DEFAULT 0,
        last_delivery_at TIMESTAMPTZ,
        last_success_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (tenant_id, name)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS endpoint_subscriptions (
        endpoint_id UUID NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
        event_type TEXT NOT NULL REFERENCES event_definitions(event_type),
        PRIMARY KEY (endpoint_id, event_type)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS event_logs (
        event_id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        source_kind TEXT,
        source_id TEXT,
        endpoints_notified INTEGER NOT NULL DEFAULT 0,
        successful_deliveries INTEGER NOT NULL DEFAULT 0,
        failed_deliveries INTEGER NOT NULL DEFAULT 0,
        is_processed BOOLEAN NOT NULL DEFAULT FALSE,
        processed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS deliveries (
        id UUID PRIMARY KEY,
        endpoint_id UUID NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
        tenant_id UUID NOT NULL,
        event_id UUID NOT NULL REFERENCES event_logs(event_id),
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempt_number INTEGER NOT NULL DEFAULT 1,
        max_attempts INTEGER NOT NULL,
        next_retry_at TIMESTAMPTZ,
        request_headers JSONB,
        request_body TEXT,
        response_status INTEGER,
        response_headers JSONB,
        response_body TEXT,
        duration_ms BIGINT,
        error_code TEXT,
        error_message TEXT,
        sent_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CHECK (attempt_number BETWEEN 1 AND max_attempts)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_due ON deliveries(status, next_retry_at)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_endpoint ON deliveries(endpoint_id)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_event ON deliveries(event_id)",
    "CREATE INDEX IF NOT EXISTS idx_event_logs_tenant ON event_logs(tenant_id, created_at DESC)",
];

/// Creates any missing tables and indexes.
///
/// # Errors
///
/// Returns error if a statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!(statements = STATEMENTS.len(), "schema up to date");
    Ok(())
}

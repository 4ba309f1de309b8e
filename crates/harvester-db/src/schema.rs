//! Schema bootstrap for the harvester tables.
//!
//! Statements are idempotent so `harvester migrate` can run on every deploy.

use harvester_core::error::AppError;
use sqlx::PgPool;

/// DDL statements, executed one by one in order.
pub const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS harvest_entities (
        source VARCHAR NOT NULL,
        kind VARCHAR NOT NULL,
        entity_id VARCHAR NOT NULL,
        fields JSONB NOT NULL DEFAULT '{}'::jsonb,
        refs JSONB NOT NULL DEFAULT '[]'::jsonb,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (source, kind, entity_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_harvest_entities_updated ON harvest_entities(source, kind, last_updated_at)",
    r#"CREATE TABLE IF NOT EXISTS harvest_checkpoints (
        source VARCHAR NOT NULL,
        stream VARCHAR NOT NULL,
        position BIGINT NOT NULL,
        cycle_count BIGINT NOT NULL DEFAULT 0,
        total_processed BIGINT NOT NULL DEFAULT 0,
        last_updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        observed_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
        worker_id VARCHAR,
        PRIMARY KEY (source, stream)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS harvest_seen (
        source VARCHAR NOT NULL,
        stream VARCHAR NOT NULL,
        position BIGINT NOT NULL,
        processed BOOLEAN NOT NULL DEFAULT FALSE,
        claimed_by VARCHAR,
        claimed_at TIMESTAMPTZ,
        PRIMARY KEY (source, stream, position)
    )"#,
];

/// Creates the harvester tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), AppError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(AppError::DatabaseError)?;
    }
    tracing::debug!(statements = SCHEMA.len(), "Schema ensured");
    Ok(())
}

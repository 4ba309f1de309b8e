//! PostgreSQL checkpoint store.
//!
//! Checkpoints live in `harvest_checkpoints`, the seen set and the claims in
//! `harvest_seen`. Every trait method is one statement (or one transaction),
//! so concurrent controllers never observe partial state.
//!
//! Claims use `INSERT ... ON CONFLICT DO UPDATE ... WHERE`: a position is
//! returned only if this statement inserted it or took over an expired claim.
//! Row locks taken by the conflict check make overlapping callers disjoint.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvester_core::checkpoint::DEFAULT_CLAIM_TTL;
use harvester_core::error::AppError;
use harvester_core::models::{Checkpoint, Position, StreamKey};
use harvester_core::traits::CheckpointStore;
use sqlx::{PgPool, Pool, Postgres};

/// PostgreSQL implementation of [`CheckpointStore`].
#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: Pool<Postgres>,
    claim_ttl: Duration,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }
}

// =============================================================================
// Helper Types for Database Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    source: String,
    stream: String,
    position: i64,
    cycle_count: i64,
    total_processed: i64,
    last_updated_at: DateTime<Utc>,
    observed_rate: f64,
    worker_id: Option<String>,
}

impl From<CheckpointRow> for Checkpoint {
    fn from(row: CheckpointRow) -> Self {
        Self {
            source: row.source,
            stream: row.stream,
            position: row.position,
            cycle_count: row.cycle_count,
            total_processed: row.total_processed,
            last_updated_at: row.last_updated_at,
            observed_rate: row.observed_rate,
            worker_id: row.worker_id,
        }
    }
}

/// Sorted, duplicate-free ids. `ON CONFLICT DO UPDATE` rejects a row that
/// appears twice in one statement.
fn unique(ids: &[Position]) -> Vec<Position> {
    ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

// =============================================================================
// CheckpointStore Trait Implementation
// =============================================================================

impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, key: &StreamKey) -> Result<Option<Checkpoint>, AppError> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT source, stream, position, cycle_count, total_processed,
                   last_updated_at, observed_rate, worker_id
            FROM harvest_checkpoints
            WHERE source = $1 AND stream = $2
            "#,
        )
        .bind(&key.source)
        .bind(&key.stream)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(row.map(Checkpoint::from))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO harvest_checkpoints (
                source, stream, position, cycle_count, total_processed,
                last_updated_at, observed_rate, worker_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (source, stream)
            DO UPDATE SET
                position = EXCLUDED.position,
                cycle_count = EXCLUDED.cycle_count,
                total_processed = EXCLUDED.total_processed,
                last_updated_at = EXCLUDED.last_updated_at,
                observed_rate = EXCLUDED.observed_rate,
                worker_id = EXCLUDED.worker_id
            "#,
        )
        .bind(&checkpoint.source)
        .bind(&checkpoint.stream)
        .bind(checkpoint.position)
        .bind(checkpoint.cycle_count)
        .bind(checkpoint.total_processed)
        .bind(checkpoint.last_updated_at)
        .bind(checkpoint.observed_rate)
        .bind(&checkpoint.worker_id)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(())
    }

    async fn filter_unprocessed(
        &self,
        key: &StreamKey,
        ids: &[Position],
        owner: &str,
    ) -> Result<Vec<Position>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO harvest_seen (source, stream, position, processed, claimed_by, claimed_at)
            SELECT $1, $2, p, FALSE, $4, NOW()
            FROM UNNEST($3::bigint[]) AS p
            ON CONFLICT (source, stream, position)
            DO UPDATE SET
                claimed_by = EXCLUDED.claimed_by,
                claimed_at = EXCLUDED.claimed_at
            WHERE harvest_seen.processed = FALSE
              AND (
                  harvest_seen.claimed_by IS NULL
                  OR harvest_seen.claimed_by = EXCLUDED.claimed_by
                  OR harvest_seen.claimed_at < NOW() - make_interval(secs => $5)
              )
            RETURNING position
            "#,
        )
        .bind(&key.source)
        .bind(&key.stream)
        .bind(unique(ids))
        .bind(owner)
        .bind(self.claim_ttl.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        let mut claimed: Vec<Position> = rows.into_iter().map(|(p,)| p).collect();
        claimed.sort_unstable();
        Ok(claimed)
    }

    async fn mark_processed(&self, key: &StreamKey, ids: &[Position]) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO harvest_seen (source, stream, position, processed)
            SELECT $1, $2, p, TRUE
            FROM UNNEST($3::bigint[]) AS p
            ON CONFLICT (source, stream, position)
            DO UPDATE SET processed = TRUE, claimed_by = NULL, claimed_at = NULL
            WHERE harvest_seen.processed = FALSE
            "#,
        )
        .bind(&key.source)
        .bind(&key.stream)
        .bind(unique(ids))
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn clear_processed(&self, key: &StreamKey) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM harvest_seen WHERE source = $1 AND stream = $2")
            .bind(&key.source)
            .bind(&key.stream)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn processed_count(&self, key: &StreamKey) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM harvest_seen
            WHERE source = $1 AND stream = $2 AND processed
            "#,
        )
        .bind(&key.source)
        .bind(&key.stream)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(count as u64)
    }

    async fn delete(&self, key: &StreamKey) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;

        sqlx::query("DELETE FROM harvest_seen WHERE source = $1 AND stream = $2")
            .bind(&key.source)
            .bind(&key.stream)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;

        let result =
            sqlx::query("DELETE FROM harvest_checkpoints WHERE source = $1 AND stream = $2")
                .bind(&key.source)
                .bind(&key.stream)
                .execute(&mut *tx)
                .await
                .map_err(AppError::DatabaseError)?;

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, AppError> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT source, stream, position, cycle_count, total_processed,
                   last_updated_at, observed_rate, worker_id
            FROM harvest_checkpoints
            ORDER BY source, stream
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows.into_iter().map(Checkpoint::from).collect())
    }
}

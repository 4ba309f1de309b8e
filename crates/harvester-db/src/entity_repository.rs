//! Entity repository for PostgreSQL.
//!
//! Every kind of a staged batch is written with one set-based upsert per
//! chunk (`INSERT ... SELECT FROM UNNEST(...) ON CONFLICT DO UPDATE`), all
//! inside a single transaction. Either the whole batch commits or nothing does.

use harvester_core::error::AppError;
use harvester_core::models::{Entity, UpdateMode};
use harvester_core::staging::StagedBatch;
use harvester_core::traits::EntityStore;
use harvester_core::writer::FlushCounts;
use serde_json::Value;
use sqlx::{PgPool, Pool, Postgres};

/// Rows per upsert statement.
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 1000;

/// Null fields of the incoming row never overwrite known values.
const UPSERT_ADDITIVE: &str = r#"
    INSERT INTO harvest_entities (source, kind, entity_id, fields, refs)
    SELECT $1, $2, e.entity_id, jsonb_strip_nulls(e.fields), e.refs
    FROM UNNEST($3::varchar[], $4::jsonb[], $5::jsonb[]) AS e(entity_id, fields, refs)
    ON CONFLICT (source, kind, entity_id)
    DO UPDATE SET
        fields = harvest_entities.fields || jsonb_strip_nulls(EXCLUDED.fields),
        refs = EXCLUDED.refs,
        last_updated_at = NOW()
"#;

const UPSERT_REPLACE: &str = r#"
    INSERT INTO harvest_entities (source, kind, entity_id, fields, refs)
    SELECT $1, $2, e.entity_id, e.fields, e.refs
    FROM UNNEST($3::varchar[], $4::jsonb[], $5::jsonb[]) AS e(entity_id, fields, refs)
    ON CONFLICT (source, kind, entity_id)
    DO UPDATE SET
        fields = EXCLUDED.fields,
        refs = EXCLUDED.refs,
        last_updated_at = NOW()
"#;

/// Repository for harvested entities.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use harvester_db::EntityRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/harvester")
///     .await?;
///
/// let repo = EntityRepository::new(pool).with_chunk_size(500);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EntityRepository {
    pool: Pool<Postgres>,
    chunk_size: usize,
}

impl EntityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Fields of one entity, or `None` if it was never written.
    pub async fn get_fields(
        &self,
        source: &str,
        kind: &str,
        entity_id: &str,
    ) -> Result<Option<Value>, AppError> {
        let row: Option<(Value,)> = sqlx::query_as(
            r#"
            SELECT fields
            FROM harvest_entities
            WHERE source = $1 AND kind = $2 AND entity_id = $3
            "#,
        )
        .bind(source)
        .bind(kind)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(row.map(|(fields,)| fields))
    }

    /// Number of stored entities of one kind.
    pub async fn count(&self, source: &str, kind: &str) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM harvest_entities WHERE source = $1 AND kind = $2",
        )
        .bind(source)
        .bind(kind)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(count)
    }
}

/// Column arrays for one UNNEST upsert.
struct EntityColumns {
    ids: Vec<String>,
    fields: Vec<Value>,
    refs: Vec<Value>,
}

impl EntityColumns {
    fn from_entities(entities: &[Entity]) -> Result<Self, AppError> {
        let mut columns = Self {
            ids: Vec::with_capacity(entities.len()),
            fields: Vec::with_capacity(entities.len()),
            refs: Vec::with_capacity(entities.len()),
        };
        for entity in entities {
            columns.ids.push(entity.id.clone());
            columns.fields.push(Value::Object(entity.fields.clone()));
            columns.refs.push(serde_json::to_value(&entity.references)?);
        }
        Ok(columns)
    }
}

impl EntityStore for EntityRepository {
    async fn write_batch(
        &self,
        source: &str,
        batch: &StagedBatch,
        mode: UpdateMode,
    ) -> Result<FlushCounts, AppError> {
        let query = match mode {
            UpdateMode::Additive => UPSERT_ADDITIVE,
            UpdateMode::Replace => UPSERT_REPLACE,
        };

        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        let mut counts = FlushCounts::default();

        // Kinds arrive in dependency order; referenced kinds first.
        for kind in &batch.kinds {
            let mut written = 0;
            for chunk in kind.entities.chunks(self.chunk_size) {
                let columns = EntityColumns::from_entities(chunk)?;
                let result = sqlx::query(query)
                    .bind(source)
                    .bind(&kind.kind)
                    .bind(&columns.ids)
                    .bind(&columns.fields)
                    .bind(&columns.refs)
                    .execute(&mut *tx)
                    .await
                    .map_err(AppError::DatabaseError)?;
                written += result.rows_affected();
            }
            counts.record(kind.kind.clone(), written);
        }

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(counts)
    }
}

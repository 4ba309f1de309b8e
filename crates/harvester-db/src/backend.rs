//! Runtime selection of the checkpoint backend.
//!
//! [`CheckpointStore`] uses `impl Future` return types, so it is not object
//! safe; [`CheckpointStoreEnum`] dispatches over the concrete stores instead
//! of a `dyn` trait object.

use harvester_core::checkpoint::MemoryCheckpointStore;
use harvester_core::config::CheckpointBackend;
use harvester_core::error::AppError;
use harvester_core::models::{Checkpoint, Position, StreamKey};
use harvester_core::traits::CheckpointStore;
use sqlx::PgPool;

use crate::{PgCheckpointStore, RedisCheckpointStore};

/// Checkpoint store chosen at startup.
#[derive(Clone)]
pub enum CheckpointStoreEnum {
    Postgres(PgCheckpointStore),
    Redis(RedisCheckpointStore),
    /// Not durable; for dry runs.
    Memory(MemoryCheckpointStore),
}

impl CheckpointStoreEnum {
    /// Builds the store for `backend`. `redis_url` is required for Redis.
    pub async fn connect(
        backend: CheckpointBackend,
        pool: &PgPool,
        redis_url: Option<&str>,
    ) -> Result<Self, AppError> {
        match backend {
            CheckpointBackend::Postgres => Ok(Self::Postgres(PgCheckpointStore::new(pool.clone()))),
            CheckpointBackend::Redis => {
                let url = redis_url.ok_or_else(|| {
                    AppError::ConfigError(
                        "REDIS_URL is required for the redis checkpoint backend".to_string(),
                    )
                })?;
                Ok(Self::Redis(RedisCheckpointStore::connect(url).await?))
            }
            CheckpointBackend::Memory => Ok(Self::Memory(MemoryCheckpointStore::new())),
        }
    }

    pub fn backend(&self) -> CheckpointBackend {
        match self {
            Self::Postgres(_) => CheckpointBackend::Postgres,
            Self::Redis(_) => CheckpointBackend::Redis,
            Self::Memory(_) => CheckpointBackend::Memory,
        }
    }
}

impl CheckpointStore for CheckpointStoreEnum {
    async fn load(&self, key: &StreamKey) -> Result<Option<Checkpoint>, AppError> {
        match self {
            Self::Postgres(s) => s.load(key).await,
            Self::Redis(s) => s.load(key).await,
            Self::Memory(s) => s.load(key).await,
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        match self {
            Self::Postgres(s) => s.save(checkpoint).await,
            Self::Redis(s) => s.save(checkpoint).await,
            Self::Memory(s) => s.save(checkpoint).await,
        }
    }

    async fn filter_unprocessed(
        &self,
        key: &StreamKey,
        ids: &[Position],
        owner: &str,
    ) -> Result<Vec<Position>, AppError> {
        match self {
            Self::Postgres(s) => s.filter_unprocessed(key, ids, owner).await,
            Self::Redis(s) => s.filter_unprocessed(key, ids, owner).await,
            Self::Memory(s) => s.filter_unprocessed(key, ids, owner).await,
        }
    }

    async fn mark_processed(&self, key: &StreamKey, ids: &[Position]) -> Result<u64, AppError> {
        match self {
            Self::Postgres(s) => s.mark_processed(key, ids).await,
            Self::Redis(s) => s.mark_processed(key, ids).await,
            Self::Memory(s) => s.mark_processed(key, ids).await,
        }
    }

    async fn clear_processed(&self, key: &StreamKey) -> Result<u64, AppError> {
        match self {
            Self::Postgres(s) => s.clear_processed(key).await,
            Self::Redis(s) => s.clear_processed(key).await,
            Self::Memory(s) => s.clear_processed(key).await,
        }
    }

    async fn processed_count(&self, key: &StreamKey) -> Result<u64, AppError> {
        match self {
            Self::Postgres(s) => s.processed_count(key).await,
            Self::Redis(s) => s.processed_count(key).await,
            Self::Memory(s) => s.processed_count(key).await,
        }
    }

    async fn delete(&self, key: &StreamKey) -> Result<bool, AppError> {
        match self {
            Self::Postgres(s) => s.delete(key).await,
            Self::Redis(s) => s.delete(key).await,
            Self::Memory(s) => s.delete(key).await,
        }
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, AppError> {
        match self {
            Self::Postgres(s) => s.list().await,
            Self::Redis(s) => s.list().await,
            Self::Memory(s) => s.list().await,
        }
    }
}

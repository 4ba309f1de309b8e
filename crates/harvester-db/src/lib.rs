//! Harvester DB - Persistence layer for PostgreSQL and Redis
//!
//! This crate implements the storage traits of `harvester-core`.
//!
//! # Overview
//!
//! The main components are:
//! - [`EntityRepository`] - Set-based entity upserts in one transaction per flush
//! - [`PgCheckpointStore`] - Checkpoints, seen set and claims in PostgreSQL
//! - [`RedisCheckpointStore`] - The same contract on a Redis-compatible server
//! - [`CheckpointStoreEnum`] - Runtime selection between checkpoint backends
//! - [`ensure_schema`] - Idempotent table bootstrap

mod backend;
mod checkpoint_repository;
mod entity_repository;
mod redis_checkpoint;
mod schema;

pub use backend::CheckpointStoreEnum;
pub use checkpoint_repository::PgCheckpointStore;
pub use entity_repository::{DEFAULT_WRITE_CHUNK_SIZE, EntityRepository};
pub use redis_checkpoint::RedisCheckpointStore;
pub use schema::{SCHEMA, ensure_schema};

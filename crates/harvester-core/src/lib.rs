//! Harvester Core - Domain types, scheduling and the persistence pipeline.
//!
//! This crate provides the engine that keeps local copies of upstream sources
//! fresh by cycling through their position ranges forever:
//!
//! - **Domain models**: [`Checkpoint`], [`Entity`], [`FetchOutcome`], [`StreamKey`], etc.
//! - **Pipeline**: [`PositionGenerator`] → [`FetchPool`] → [`StagingBuffer`] → [`BulkWriter`]
//! - **Orchestration**: [`CycleController`] per stream, [`Supervisor`] and [`Watchdog`]
//! - **Traits**: [`SourceClient`], [`EntityParser`], [`EntityStore`], [`CheckpointStore`]
//! - **Progress reporting**: [`ProgressReporter`] trait for decoupled logging/UI
//!
//! # Architecture
//!
//! The engine only talks to the outside world through traits, so frontends
//! (the `harvester` CLI, tests) choose the implementations:
//!
//! - [`SourceClient`] - fetches one position (e.g. HTTP via `harvester-client`)
//! - [`EntityParser`] - extracts entities from a payload
//! - [`EntityStore`] - bulk upserts (e.g. PostgreSQL via `harvester-db`)
//! - [`CheckpointStore`] - durable progress (PostgreSQL, Redis or in memory)
//!
//! # Example
//!
//! ```ignore
//! use harvester_core::{CycleController, FetchPool, TracingReporter};
//! use tokio_util::sync::CancellationToken;
//!
//! let pool = FetchPool::new(client, source.fetch_config(), breaker);
//! let controller = CycleController::new(
//!     source.key(),
//!     pool,
//!     parser,
//!     entity_store,
//!     checkpoint_store,
//!     source.controller_config(),
//! );
//! let summary = controller.run(CancellationToken::new(), &TracingReporter).await?;
//! ```

pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod controller;
pub mod error;
pub mod fetch;
pub mod models;
pub mod position;
pub mod progress;
pub mod staging;
pub mod stats;
pub mod traits;
pub mod watchdog;
pub mod writer;

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};

// Configuration
pub use config::{
    CheckpointBackend, DbConfig, EntityRule, RefRule, SourceConfig, SourcesConfig, WatchdogConfig,
    default_config_path, load_sources_config,
};

// Error handling
pub use error::AppError;

// Domain models
pub use models::{
    Checkpoint, Entity, EntityRef, FetchOutcome, FetchResult, Position, PositionRange, RawPayload,
    StreamKey, UpdateMode,
};

// Pipeline
pub use checkpoint::MemoryCheckpointStore;
pub use fetch::{FetchConfig, FetchPool, RetryPolicy};
pub use position::{PositionBlock, PositionGenerator, Step};
pub use staging::{KindBatch, StageSignal, StagedBatch, StagingBuffer};
pub use stats::{BlockStats, RateMeter};
pub use writer::{BulkWriter, FlushCounts, FlushReport};

// Orchestration
pub use controller::{ControllerConfig, ControllerState, ControllerSummary, CycleController};
pub use watchdog::{
    RestartOutcome, StreamHealth, StreamReport, Supervisor, Watchdog, stream_health,
};

// Progress reporting
pub use progress::{HarvestEvent, ProgressReporter, SilentReporter, TracingReporter};

// Traits for dependency injection
pub use traits::{
    CheckpointStore, EntityParser, EntityStore, ParseResult, SourceClient, StreamLauncher,
};

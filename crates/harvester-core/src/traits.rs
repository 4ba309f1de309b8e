//! Trait definitions for external dependencies.
//!
//! The harvesting engine only talks to the outside world through these
//! traits, which keeps the controller testable with in-memory mocks:
//!
//! - [`SourceClient`] - fetches the raw payload of one position
//! - [`EntityParser`] - turns a payload into normalized entities
//! - [`EntityStore`] - persists staged entities in bulk
//! - [`CheckpointStore`] - durable progress and the seen set
//! - [`StreamLauncher`] - spawns controllers for the supervisor
//!
//! Runtime selection between implementations uses enums (see
//! `harvester_db::CheckpointStoreEnum` and `harvester_client::SourceClientEnum`)
//! instead of trait objects, because the traits return `impl Future`.
//!
//! # Example
//!
//! ```
//! use harvester_core::traits::{EntityParser, ParseResult, SourceClient};
//! use harvester_core::{AppError, Position};
//!
//! async fn harvest_one<C, P>(client: &C, parser: &P, position: Position) -> Result<usize, AppError>
//! where
//!     C: SourceClient,
//!     P: EntityParser,
//! {
//!     let payload = client.fetch(position).await?;
//!     match parser.parse(&payload) {
//!         ParseResult::Parsed(entities) => Ok(entities.len()),
//!         ParseResult::Empty => Ok(0),
//!         ParseResult::Failed(reason) => Err(AppError::ParseError(reason)),
//!     }
//! }
//! ```

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerSummary;
use crate::error::AppError;
use crate::models::{Checkpoint, Entity, Position, RawPayload, StreamKey, UpdateMode};
use crate::staging::StagedBatch;
use crate::writer::FlushCounts;

/// Client for one upstream source.
pub trait SourceClient: Send + Sync + Clone {
    /// Fetches the payload stored at `position`.
    ///
    /// Implementations map upstream responses onto [`AppError`]:
    /// `NotFound` for missing items, `RateLimitExceeded`, `SessionExpired`,
    /// `Blocked`, `ServerError`, `Timeout` and `NetworkError` for the rest.
    fn fetch(&self, position: Position)
    -> impl Future<Output = Result<RawPayload, AppError>> + Send;

    /// Called after a `SessionExpired` error. Resolves once a fresh session
    /// is available or the wait gave up.
    fn on_session_expired(&self) -> impl Future<Output = Result<(), AppError>> + Send {
        async { Ok(()) }
    }
}

/// Outcome of parsing one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    Parsed(Vec<Entity>),
    /// Valid payload without any entity (e.g. an empty listing page).
    Empty,
    /// Payload could not be interpreted. Logged and skipped by the controller.
    Failed(String),
}

impl ParseResult {
    pub fn entity_count(&self) -> usize {
        match self {
            ParseResult::Parsed(entities) => entities.len(),
            _ => 0,
        }
    }
}

/// Converts raw payloads into entities. Must never panic on malformed input.
pub trait EntityParser: Send + Sync + Clone {
    fn parse(&self, payload: &RawPayload) -> ParseResult;

    /// Preferred kind order, used to break ties when writing independent kinds.
    fn kind_order(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Store for harvested entities.
pub trait EntityStore: Send + Sync + Clone {
    /// Upserts every entity of the batch in a single transaction.
    ///
    /// Kinds are written in the batch order. Either every kind is committed
    /// or none is.
    ///
    /// # Returns
    ///
    /// Rows written (inserted + updated) per kind.
    fn write_batch(
        &self,
        source: &str,
        batch: &StagedBatch,
        mode: UpdateMode,
    ) -> impl Future<Output = Result<FlushCounts, AppError>> + Send;
}

/// Durable checkpoint and seen-set storage.
///
/// Every mutating method must be a single atomic round trip so that
/// concurrent controllers never observe partial state.
pub trait CheckpointStore: Send + Sync + Clone {
    fn load(
        &self,
        key: &StreamKey,
    ) -> impl Future<Output = Result<Option<Checkpoint>, AppError>> + Send;

    /// Writes the checkpoint, last writer wins.
    fn save(&self, checkpoint: &Checkpoint) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Returns the ids that are neither processed nor claimed by another
    /// owner, and claims them for `owner`.
    ///
    /// Concurrent callers with overlapping id lists receive disjoint results.
    fn filter_unprocessed(
        &self,
        key: &StreamKey,
        ids: &[Position],
        owner: &str,
    ) -> impl Future<Output = Result<Vec<Position>, AppError>> + Send;

    /// Adds ids to the seen set. Returns how many were newly marked.
    fn mark_processed(
        &self,
        key: &StreamKey,
        ids: &[Position],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Empties the seen set, typically at the end of a cycle.
    fn clear_processed(&self, key: &StreamKey)
    -> impl Future<Output = Result<u64, AppError>> + Send;

    fn processed_count(&self, key: &StreamKey)
    -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Removes the checkpoint and its seen set. Returns false if none existed.
    fn delete(&self, key: &StreamKey) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// All stored checkpoints, ordered by key.
    fn list(&self) -> impl Future<Output = Result<Vec<Checkpoint>, AppError>> + Send;
}

/// Starts a controller task for a stream. Used by the supervisor.
pub trait StreamLauncher: Send + Sync + Clone + 'static {
    fn launch(
        &self,
        key: &StreamKey,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<ControllerSummary, AppError>>, AppError>;
}

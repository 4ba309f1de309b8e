//! Test utilities and mock implementations for integration tests.
//!
//! Provides in-memory implementations of the core traits so controllers can
//! be exercised without a network or a database.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harvester_core::traits::{CheckpointStore, EntityParser, EntityStore, SourceClient};
use harvester_core::{
    AppError, Checkpoint, CircuitBreaker, CircuitBreakerConfig, ControllerConfig,
    CycleController, Entity, FetchConfig, FetchPool, FlushCounts, HarvestEvent, MemoryCheckpointStore,
    ParseResult, Position, ProgressReporter, RawPayload, StagedBatch, StreamKey, UpdateMode,
};
use serde_json::{Value, json};
use tokio::time::Instant;

// =============================================================================
// MockSourceClient
// =============================================================================

/// Source with one product per position.
///
/// Positions in `missing` return `NotFound`, positions in `empty` return a
/// page without items, scripted positions pop errors before succeeding.
#[derive(Clone, Default)]
pub struct MockSourceClient {
    missing: Arc<HashSet<Position>>,
    empty_from: Option<Position>,
    with_sellers: bool,
    scripts: Arc<Mutex<HashMap<Position, Vec<AppError>>>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<BTreeMap<Position, u32>>>,
    in_flight: Arc<AtomicU32>,
}

/// Decrements the in-flight counter when a fetch ends or is dropped.
struct InFlight(Arc<AtomicU32>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU32>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockSourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_missing(mut self, positions: impl IntoIterator<Item = Position>) -> Self {
        self.missing = Arc::new(positions.into_iter().collect());
        self
    }

    /// Positions from `first` on are empty listing pages.
    pub fn with_empty_from(mut self, first: Position) -> Self {
        self.empty_from = Some(first);
        self
    }

    /// Every product references seller `position % 3`.
    pub fn with_sellers(mut self) -> Self {
        self.with_sellers = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(self, position: Position, errors: Vec<AppError>) -> Self {
        self.scripts.lock().unwrap().insert(position, errors);
        self
    }

    pub fn calls_for(&self, position: Position) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&position)
            .copied()
            .unwrap_or(0)
    }

    pub fn called_positions(&self) -> Vec<Position> {
        self.calls.lock().unwrap().keys().copied().collect()
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    /// Number of fetches currently running.
    pub fn in_flight(&self) -> Arc<AtomicU32> {
        self.in_flight.clone()
    }
}

impl SourceClient for MockSourceClient {
    async fn fetch(&self, position: Position) -> Result<RawPayload, AppError> {
        *self.calls.lock().unwrap().entry(position).or_insert(0) += 1;
        let _in_flight = InFlight::enter(&self.in_flight);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.get_mut(&position).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };
        if let Some(error) = scripted {
            return Err(error);
        }

        if self.missing.contains(&position) {
            return Err(AppError::NotFound(position.to_string()));
        }
        if self.empty_from.is_some_and(|first| position >= first) {
            return Ok(RawPayload::json_payload(&json!({ "items": [] })));
        }

        let mut product = json!({ "id": position, "title": format!("product {}", position) });
        if self.with_sellers {
            product["seller"] = json!(position % 3);
        }
        Ok(RawPayload::json_payload(&json!({ "items": [product] })))
    }
}

// =============================================================================
// MockParser
// =============================================================================

/// Parses `{"items": [{"id", "title", "seller"?}]}` into product entities and
/// their sellers.
#[derive(Clone, Default)]
pub struct MockParser;

impl EntityParser for MockParser {
    fn parse(&self, payload: &RawPayload) -> ParseResult {
        let Ok(value) = payload.json() else {
            return ParseResult::Failed("not json".to_string());
        };
        let Some(items) = value["items"].as_array() else {
            return ParseResult::Failed("missing items".to_string());
        };

        let mut entities = Vec::new();
        for item in items {
            let Some(id) = item["id"].as_i64() else {
                continue;
            };
            let mut product = Entity::new("product", id.to_string())
                .with_field("title", item["title"].clone());
            if let Some(seller) = item["seller"].as_i64() {
                product = product.with_reference("seller", seller.to_string());
                entities.push(Entity::new("seller", seller.to_string()));
            }
            entities.push(product);
        }

        if entities.is_empty() {
            ParseResult::Empty
        } else {
            ParseResult::Parsed(entities)
        }
    }

    fn kind_order(&self) -> Vec<String> {
        vec!["seller".to_string(), "product".to_string()]
    }
}

// =============================================================================
// MockEntityStore
// =============================================================================

/// Entity table keyed by `(kind, id)` with additive or replace semantics.
#[derive(Clone, Default)]
pub struct MockEntityStore {
    pub rows: Arc<Mutex<HashMap<(String, String), Value>>>,
    /// Kind order of every successful write.
    pub writes: Arc<Mutex<Vec<Vec<String>>>>,
    /// Entity count of every write attempt.
    pub batch_sizes: Arc<Mutex<Vec<usize>>>,
    /// Source fetches running at every write attempt, when watched.
    pub fetches_during_writes: Arc<Mutex<Vec<u32>>>,
    watched: Option<Arc<AtomicU32>>,
    failures_left: Arc<AtomicU32>,
    always_fail: bool,
}

impl MockEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` writes fail.
    pub fn failing(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Records how many fetches of `client` run while a batch is written.
    pub fn watching(mut self, client: &MockSourceClient) -> Self {
        self.watched = Some(client.in_flight());
        self
    }

    pub fn unavailable() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn contains(&self, kind: &str, id: &str) -> bool {
        self.rows
            .lock()
            .unwrap()
            .contains_key(&(kind.to_string(), id.to_string()))
    }

    pub fn ids(&self, kind: &str) -> HashSet<String> {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _)| k == kind)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

impl EntityStore for MockEntityStore {
    async fn write_batch(
        &self,
        _source: &str,
        batch: &StagedBatch,
        mode: UpdateMode,
    ) -> Result<FlushCounts, AppError> {
        self.batch_sizes.lock().unwrap().push(batch.len());
        if let Some(in_flight) = &self.watched {
            self.fetches_during_writes
                .lock()
                .unwrap()
                .push(in_flight.load(Ordering::SeqCst));
        }
        if self.always_fail
            || self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(AppError::StoreUnavailable("connection refused".into()));
        }

        let mut rows = self.rows.lock().unwrap();
        let mut counts = FlushCounts::default();
        for kind in &batch.kinds {
            for entity in &kind.entities {
                let incoming = Value::Object(entity.fields.clone());
                let row = rows.entry(entity.key()).or_insert_with(|| json!({}));
                match mode {
                    UpdateMode::Replace => *row = incoming,
                    UpdateMode::Additive => {
                        if let (Some(row), Value::Object(fields)) = (row.as_object_mut(), incoming)
                        {
                            for (name, value) in fields {
                                if !value.is_null() {
                                    row.insert(name, value);
                                }
                            }
                        }
                    }
                }
            }
            counts.record(kind.kind.clone(), kind.entities.len() as u64);
        }
        self.writes
            .lock()
            .unwrap()
            .push(batch.kinds.iter().map(|k| k.kind.clone()).collect());
        Ok(counts)
    }
}

// =============================================================================
// AuditedCheckpointStore
// =============================================================================

/// Checkpoint store that records, at every save, how many rows the entity
/// store held. Lets tests verify that checkpoints never run ahead of data.
#[derive(Clone)]
pub struct AuditedCheckpointStore {
    pub inner: MemoryCheckpointStore,
    entities: MockEntityStore,
    pub audit: Arc<Mutex<Vec<(Checkpoint, usize)>>>,
    /// Clock reading of every save, on the paused test clock.
    pub saved_at: Arc<Mutex<Vec<Instant>>>,
}

impl AuditedCheckpointStore {
    pub fn new(inner: MemoryCheckpointStore, entities: MockEntityStore) -> Self {
        Self {
            inner,
            entities,
            audit: Arc::new(Mutex::new(Vec::new())),
            saved_at: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Longest time between two consecutive saves.
    pub fn longest_gap(&self) -> Duration {
        let saved_at = self.saved_at.lock().unwrap();
        saved_at
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .max()
            .unwrap_or_default()
    }
}

impl CheckpointStore for AuditedCheckpointStore {
    async fn load(&self, key: &StreamKey) -> Result<Option<Checkpoint>, AppError> {
        self.inner.load(key).await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        let rows = self.entities.len();
        self.audit.lock().unwrap().push((checkpoint.clone(), rows));
        self.saved_at.lock().unwrap().push(Instant::now());
        self.inner.save(checkpoint).await
    }

    async fn filter_unprocessed(
        &self,
        key: &StreamKey,
        ids: &[Position],
        owner: &str,
    ) -> Result<Vec<Position>, AppError> {
        self.inner.filter_unprocessed(key, ids, owner).await
    }

    async fn mark_processed(&self, key: &StreamKey, ids: &[Position]) -> Result<u64, AppError> {
        self.inner.mark_processed(key, ids).await
    }

    async fn clear_processed(&self, key: &StreamKey) -> Result<u64, AppError> {
        self.inner.clear_processed(key).await
    }

    async fn processed_count(&self, key: &StreamKey) -> Result<u64, AppError> {
        self.inner.processed_count(key).await
    }

    async fn delete(&self, key: &StreamKey) -> Result<bool, AppError> {
        self.inner.delete(key).await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, AppError> {
        self.inner.list().await
    }
}

// =============================================================================
// CrashingCheckpointStore
// =============================================================================

/// Checkpoint operation at which [`CrashingCheckpointStore`] stops the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    MarkProcessed,
    Save,
}

/// Checkpoint store that never returns from `at` once the entity store holds
/// `after_rows` rows. Aborting the stuck controller then stands in for a
/// process dying between a flush and its checkpoint.
#[derive(Clone)]
pub struct CrashingCheckpointStore {
    pub inner: MemoryCheckpointStore,
    entities: MockEntityStore,
    at: CrashPoint,
    after_rows: usize,
}

impl CrashingCheckpointStore {
    pub fn new(
        inner: MemoryCheckpointStore,
        entities: MockEntityStore,
        at: CrashPoint,
        after_rows: usize,
    ) -> Self {
        Self {
            inner,
            entities,
            at,
            after_rows,
        }
    }

    async fn maybe_crash(&self, point: CrashPoint) {
        if point == self.at && self.entities.len() >= self.after_rows {
            std::future::pending::<()>().await;
        }
    }
}

impl CheckpointStore for CrashingCheckpointStore {
    async fn load(&self, key: &StreamKey) -> Result<Option<Checkpoint>, AppError> {
        self.inner.load(key).await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        self.maybe_crash(CrashPoint::Save).await;
        self.inner.save(checkpoint).await
    }

    async fn filter_unprocessed(
        &self,
        key: &StreamKey,
        ids: &[Position],
        owner: &str,
    ) -> Result<Vec<Position>, AppError> {
        self.inner.filter_unprocessed(key, ids, owner).await
    }

    async fn mark_processed(&self, key: &StreamKey, ids: &[Position]) -> Result<u64, AppError> {
        self.maybe_crash(CrashPoint::MarkProcessed).await;
        self.inner.mark_processed(key, ids).await
    }

    async fn clear_processed(&self, key: &StreamKey) -> Result<u64, AppError> {
        self.inner.clear_processed(key).await
    }

    async fn processed_count(&self, key: &StreamKey) -> Result<u64, AppError> {
        self.inner.processed_count(key).await
    }

    async fn delete(&self, key: &StreamKey) -> Result<bool, AppError> {
        self.inner.delete(key).await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, AppError> {
        self.inner.list().await
    }
}

// =============================================================================
// RecordingReporter
// =============================================================================

/// Reporter that keeps a short label of every event.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == label)
            .count()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: HarvestEvent<'_>) {
        let label = match event {
            HarvestEvent::Resumed { .. } => "resumed",
            HarvestEvent::StateChanged { .. } => return,
            HarvestEvent::BlockFetched { .. } => "block_fetched",
            HarvestEvent::ParseFailed { .. } => "parse_failed",
            HarvestEvent::Flushed { .. } => "flushed",
            HarvestEvent::StoreFailed { .. } => "store_failed",
            HarvestEvent::CheckpointSaved { .. } => "checkpoint_saved",
            HarvestEvent::CycleCompleted { .. } => "cycle_completed",
            HarvestEvent::BreakerOpened { .. } => "breaker_opened",
            HarvestEvent::BreakerClosed { .. } => "breaker_closed",
            HarvestEvent::StreamStale { .. } => "stream_stale",
            HarvestEvent::StreamRestarted { .. } => "stream_restarted",
            HarvestEvent::Shutdown { .. } => "shutdown",
            HarvestEvent::Fatal { .. } => "fatal",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// =============================================================================
// Builders
// =============================================================================

pub fn stream_key() -> StreamKey {
    StreamKey::new("shop", "products")
}

pub fn fetch_pool(client: MockSourceClient, concurrency: usize) -> FetchPool<MockSourceClient> {
    FetchPool::new(
        client,
        FetchConfig::default().with_concurrency(concurrency),
        CircuitBreaker::new("shop/products", CircuitBreakerConfig::default()),
    )
}

pub fn controller<K: CheckpointStore>(
    client: MockSourceClient,
    store: MockEntityStore,
    checkpoints: K,
    config: ControllerConfig,
) -> CycleController<MockSourceClient, MockParser, MockEntityStore, K> {
    CycleController::new(
        stream_key(),
        fetch_pool(client, 10),
        MockParser,
        store,
        checkpoints,
        config,
    )
}

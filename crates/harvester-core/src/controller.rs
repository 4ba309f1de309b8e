//! Cycle controller: drives one stream through its range, forever.
//!
//! # State machine
//!
//! ```text
//! Resuming -> Fetching -> Staging -> Flushing -> Checkpointing -> Fetching ...
//!                 |                                                  ^
//!                 +--[range exhausted]--> CycleComplete --[pause]----+
//! ```
//!
//! For every block the controller claims the unprocessed positions through
//! [`CheckpointStore::filter_unprocessed`], fetches them with the
//! [`FetchPool`], parses each payload and stages the entities. Blocks
//! accumulate in the staging buffer until it is full, the cycle ends or the
//! controller shuts down; then the buffer is flushed in one transaction.
//!
//! The checkpoint is saved after every block. Its position only moves past
//! blocks whose entities are all flushed, and a position is marked processed
//! only once nothing of it is left in the buffer. Sparse ranges, where the
//! buffer takes hours to fill, therefore still refresh `last_updated_at`
//! for the watchdog. A crash loses at most unsaved progress, never
//! acknowledged progress.
//!
//! # Failure handling
//!
//! - Per-position failures are absorbed by the fetch pool and the breaker.
//! - Store failures (flush, checkpoint, seen set) are retried every
//!   `flush_retry_delay`. After `flush_max_attempts` consecutive failures the
//!   circuit breaker is tripped, which also pauses fetching, and retrying
//!   continues after its cooldown. Staged entities are never dropped.
//! - Fatal errors (invalid configuration, corrupt checkpoint) stop the loop.
//!
//! # Graceful Shutdown
//!
//! On cancellation the in-flight fetches of the current block finish, staged
//! entities are flushed and the checkpoint is saved up to the last completed
//! block.

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitState;
use crate::error::AppError;
use crate::fetch::FetchPool;
use crate::models::{
    Checkpoint, Entity, FetchOutcome, Position, PositionRange, RawPayload, StreamKey, UpdateMode,
};
use crate::position::{PositionBlock, PositionGenerator, Step};
use crate::progress::{HarvestEvent, ProgressReporter};
use crate::staging::StagingBuffer;
use crate::stats::{BlockStats, RateMeter};
use crate::traits::{CheckpointStore, EntityParser, EntityStore, ParseResult, SourceClient};
use crate::writer::BulkWriter;

/// Current phase of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Resuming,
    Fetching,
    Staging,
    Flushing,
    Checkpointing,
    CycleComplete,
    Stopped,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControllerState::Resuming => "resuming",
            ControllerState::Fetching => "fetching",
            ControllerState::Staging => "staging",
            ControllerState::Flushing => "flushing",
            ControllerState::Checkpointing => "checkpointing",
            ControllerState::CycleComplete => "cycle_complete",
            ControllerState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Runtime configuration of a [`CycleController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub range: PositionRange,
    pub block_size: usize,
    /// Staging buffer cap.
    pub batch_flush_size: usize,
    /// Consecutive empty blocks that end a paginated cycle.
    pub empty_page_threshold: u32,
    pub inter_cycle_pause: Duration,
    pub inter_block_delay: Duration,
    pub flush_retry_delay: Duration,
    /// Consecutive store failures before the circuit breaker is tripped.
    pub flush_max_attempts: u32,
    pub update_mode: UpdateMode,
    /// Declared kind order; the parser's order is used when empty.
    pub kind_order: Vec<String>,
    /// Stop after this many completed cycles. Runs forever when `None`.
    pub max_cycles: Option<u64>,
    /// Identity used for claims and recorded in checkpoints.
    pub worker_id: String,
}

impl ControllerConfig {
    pub fn new(range: PositionRange) -> Self {
        Self {
            range,
            block_size: 500,
            batch_flush_size: 1000,
            empty_page_threshold: 3,
            inter_cycle_pause: Duration::from_secs(60),
            inter_block_delay: Duration::ZERO,
            flush_retry_delay: Duration::from_secs(5),
            flush_max_attempts: 3,
            update_mode: UpdateMode::default(),
            kind_order: Vec::new(),
            max_cycles: None,
            worker_id: default_worker_id(),
        }
    }

    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn with_batch_flush_size(mut self, size: usize) -> Self {
        self.batch_flush_size = size;
        self
    }

    pub fn with_empty_page_threshold(mut self, threshold: u32) -> Self {
        self.empty_page_threshold = threshold;
        self
    }

    pub fn with_inter_cycle_pause(mut self, pause: Duration) -> Self {
        self.inter_cycle_pause = pause;
        self
    }

    pub fn with_inter_block_delay(mut self, delay: Duration) -> Self {
        self.inter_block_delay = delay;
        self
    }

    pub fn with_flush_retry(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.flush_retry_delay = delay;
        self.flush_max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    pub fn with_kind_order(mut self, kinds: Vec<String>) -> Self {
        self.kind_order = kinds;
        self
    }

    pub fn with_max_cycles(mut self, cycles: Option<u64>) -> Self {
        self.max_cycles = cycles;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

fn default_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("harvester-{}", &id[..8])
}

/// What a controller did before it stopped.
#[derive(Debug, Clone, Default)]
pub struct ControllerSummary {
    pub cycles_completed: u64,
    pub blocks_processed: u64,
    pub positions_fetched: u64,
    pub entities_written: u64,
    pub checkpoint: Option<Checkpoint>,
}

/// Mutable state of one run.
struct RunState {
    checkpoint: Checkpoint,
    buffer: StagingBuffer,
    /// Positions with entities still in the buffer.
    staged_positions: Vec<Position>,
    /// Positions with nothing left to write, not yet marked processed.
    settled_positions: Vec<Position>,
    /// End of the last completed block of this cycle.
    completed_end: Option<Position>,
    /// End of the last completed block whose entities are all flushed.
    durable_end: Option<Position>,
    /// Entities flushed since the last checkpoint save.
    unsaved_written: u64,
    meter: RateMeter,
    summary: ControllerSummary,
    breaker_trips: u64,
    breaker_open: bool,
}

/// Harvests one stream.
pub struct CycleController<C, P, S, K>
where
    C: SourceClient,
    P: EntityParser,
    S: EntityStore,
    K: CheckpointStore,
{
    key: StreamKey,
    pool: FetchPool<C>,
    parser: P,
    writer: BulkWriter<S>,
    checkpoints: K,
    config: ControllerConfig,
}

impl<C, P, S, K> CycleController<C, P, S, K>
where
    C: SourceClient,
    P: EntityParser,
    S: EntityStore,
    K: CheckpointStore,
{
    pub fn new(
        key: StreamKey,
        pool: FetchPool<C>,
        parser: P,
        store: S,
        checkpoints: K,
        config: ControllerConfig,
    ) -> Self {
        let writer = BulkWriter::new(store, config.update_mode);
        Self {
            key,
            pool,
            parser,
            writer,
            checkpoints,
            config,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Runs until cancelled, `max_cycles` is reached or a fatal error occurs.
    pub async fn run<R: ProgressReporter>(
        &self,
        cancel: CancellationToken,
        reporter: &R,
    ) -> Result<ControllerSummary, AppError> {
        match self.run_inner(&cancel, reporter).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                let message = e.to_string();
                reporter.report(HarvestEvent::Fatal {
                    stream: &self.key,
                    error: &message,
                });
                Err(e)
            }
        }
    }

    async fn run_inner<R: ProgressReporter>(
        &self,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<ControllerSummary, AppError> {
        self.transition(reporter, ControllerState::Resuming);
        let checkpoint = self.resume(cancel, reporter).await?;
        let mut generator = self.generator_for(&checkpoint)?;

        reporter.report(HarvestEvent::Resumed {
            stream: &self.key,
            position: checkpoint.position,
            cycle: checkpoint.cycle_count,
        });

        let kind_order = if self.config.kind_order.is_empty() {
            self.parser.kind_order()
        } else {
            self.config.kind_order.clone()
        };
        let mut run = RunState {
            checkpoint,
            buffer: StagingBuffer::new(self.config.batch_flush_size, kind_order),
            staged_positions: Vec::new(),
            settled_positions: Vec::new(),
            completed_end: None,
            durable_end: None,
            unsaved_written: 0,
            meter: RateMeter::new(),
            summary: ControllerSummary::default(),
            breaker_trips: self.pool.breaker().stats().total_trips,
            breaker_open: false,
        };

        while !cancel.is_cancelled() {
            match generator.next_block() {
                Step::Block(block) => {
                    let Some(items) = self
                        .harvest_block(block, &mut run, cancel, reporter)
                        .await?
                    else {
                        break;
                    };
                    generator.record_block_items(items);
                    self.save_checkpoint(&mut run, cancel, reporter).await?;

                    if !self.config.inter_block_delay.is_zero() {
                        tokio::select! {
                            _ = sleep(self.config.inter_block_delay) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                }
                Step::CycleComplete => {
                    self.complete_cycle(&mut run, cancel, reporter).await?;

                    let done = self
                        .config
                        .max_cycles
                        .is_some_and(|max| run.summary.cycles_completed >= max);
                    if done {
                        break;
                    }

                    tokio::select! {
                        _ = sleep(self.config.inter_cycle_pause) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        // Clean shutdown never skips a save.
        self.flush_and_checkpoint(&mut run, cancel, reporter).await?;

        self.transition(reporter, ControllerState::Stopped);
        reporter.report(HarvestEvent::Shutdown {
            stream: &self.key,
            position: run.checkpoint.position,
        });

        let mut summary = run.summary;
        summary.checkpoint = Some(run.checkpoint);
        Ok(summary)
    }

    /// Loads the checkpoint, or creates one at the start of the range.
    async fn resume<R: ProgressReporter>(
        &self,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<Checkpoint, AppError> {
        let loaded = self
            .with_store_retry("load", cancel, reporter, || self.checkpoints.load(&self.key))
            .await?;

        match loaded {
            Some(checkpoint) => {
                checkpoint.validate(&self.config.range)?;
                Ok(checkpoint)
            }
            None => {
                let mut checkpoint = Checkpoint::new(&self.key, self.config.range.min, Utc::now());
                checkpoint.worker_id = Some(self.config.worker_id.clone());
                self.with_store_retry("save", cancel, reporter, || {
                    self.checkpoints.save(&checkpoint)
                })
                .await?;
                tracing::info!(stream = %self.key, position = checkpoint.position, "Created checkpoint");
                Ok(checkpoint)
            }
        }
    }

    fn generator_for(&self, checkpoint: &Checkpoint) -> Result<PositionGenerator, AppError> {
        let range = self.config.range;
        if range.is_bounded() {
            PositionGenerator::new(
                range,
                self.config.block_size,
                checkpoint.position,
                checkpoint.cycle_count,
            )
        } else {
            PositionGenerator::paginated(
                range.min,
                self.config.block_size,
                checkpoint.position,
                checkpoint.cycle_count,
                self.config.empty_page_threshold,
            )
        }
    }

    /// Fetches, parses and stages one block.
    ///
    /// Returns the number of items the block yielded, or `None` when
    /// cancellation interrupted it before every claimed position was fetched.
    async fn harvest_block<R: ProgressReporter>(
        &self,
        block: PositionBlock,
        run: &mut RunState,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<Option<usize>, AppError> {
        self.transition(reporter, ControllerState::Fetching);

        let positions: Vec<Position> = block.positions().collect();
        let claimed = self
            .with_store_retry("filter_unprocessed", cancel, reporter, || {
                self.checkpoints
                    .filter_unprocessed(&self.key, &positions, &self.config.worker_id)
            })
            .await?;

        let mut stats = BlockStats::new();
        stats.skipped = positions.len() - claimed.len();
        let expected = claimed.len();

        // Results that do not fit the buffer are staged once no fetch of the
        // block is in flight, so a flush never runs beside open requests.
        let mut held_back: Vec<(Position, Vec<Entity>)> = Vec::new();

        let mut results = pin!(self.pool.fetch_positions(claimed, cancel));
        while let Some(result) = results.next().await {
            stats.record(&result.outcome);
            match result.outcome {
                FetchOutcome::Success(payload) => {
                    let entities = self.parse(result.position, &payload, &mut stats, reporter);
                    if entities.is_empty() {
                        run.settled_positions.push(result.position);
                    } else if run.buffer.has_room_for(entities.len()) {
                        self.transition(reporter, ControllerState::Staging);
                        for entity in entities {
                            run.buffer.stage(entity);
                        }
                        run.staged_positions.push(result.position);
                    } else {
                        held_back.push((result.position, entities));
                    }
                }
                FetchOutcome::NotFound | FetchOutcome::PermanentError(_) => {
                    run.settled_positions.push(result.position);
                }
                // Transient failures stay unmarked and are retried next cycle.
                _ => {}
            }
        }

        for (position, entities) in held_back {
            self.transition(reporter, ControllerState::Staging);
            for entity in entities {
                if run.buffer.is_full() {
                    self.flush(run, cancel, reporter).await?;
                }
                run.buffer.stage(entity);
            }
            // Only after all of its entities are staged, so a flush in the
            // middle of them does not settle the position.
            run.staged_positions.push(position);
        }
        if run.buffer.is_full() {
            self.flush(run, cancel, reporter).await?;
        }

        let attempted = stats.attempted();
        run.meter.record(stats.total());
        run.summary.positions_fetched += attempted as u64;
        self.report_breaker(run, reporter);

        if attempted < expected {
            return Ok(None);
        }

        run.completed_end = Some(block.end);
        if run.buffer.is_empty() {
            run.durable_end = Some(block.end);
        }
        run.summary.blocks_processed += 1;

        reporter.report(HarvestEvent::BlockFetched {
            stream: &self.key,
            block,
            stats: &stats,
        });

        // Skipped and failed positions are not evidence of an empty page.
        Ok(Some(stats.entities + stats.skipped + stats.failed))
    }

    /// Parses one payload. Parse failures are reported and yield nothing.
    fn parse<R: ProgressReporter>(
        &self,
        position: Position,
        payload: &RawPayload,
        stats: &mut BlockStats,
        reporter: &R,
    ) -> Vec<Entity> {
        match self.parser.parse(payload) {
            ParseResult::Parsed(entities) => {
                stats.entities += entities.len();
                entities
            }
            ParseResult::Empty => Vec::new(),
            ParseResult::Failed(reason) => {
                stats.parse_failed += 1;
                reporter.report(HarvestEvent::ParseFailed {
                    stream: &self.key,
                    position,
                    reason: &reason,
                });
                Vec::new()
            }
        }
    }

    /// Writes the whole buffer in one transaction.
    ///
    /// On success every staged position is settled and every completed
    /// block becomes durable.
    async fn flush<R: ProgressReporter>(
        &self,
        run: &mut RunState,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        if run.buffer.is_empty() {
            return Ok(());
        }
        self.transition(reporter, ControllerState::Flushing);
        let batch = run.buffer.drain();
        let flushed = self
            .with_store_retry("flush", cancel, reporter, || {
                self.writer.flush(&self.key.source, &batch)
            })
            .await;

        let report = match flushed {
            Ok(report) => report,
            Err(e) => {
                run.buffer.restore(batch);
                return Err(e);
            }
        };

        run.unsaved_written += report.written();
        run.summary.entities_written += report.written();
        run.settled_positions.append(&mut run.staged_positions);
        if run.completed_end.is_some() {
            run.durable_end = run.completed_end;
        }

        reporter.report(HarvestEvent::Flushed {
            stream: &self.key,
            written: report.written(),
            elapsed: report.elapsed,
        });
        Ok(())
    }

    /// Flushes the buffer and saves the checkpoint.
    async fn flush_and_checkpoint<R: ProgressReporter>(
        &self,
        run: &mut RunState,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        self.flush(run, cancel, reporter).await?;
        self.save_checkpoint(run, cancel, reporter).await
    }

    /// Marks settled positions processed and saves the checkpoint up to the
    /// last durable block.
    ///
    /// Runs after every block: when nothing became durable the save only
    /// refreshes `last_updated_at`.
    async fn save_checkpoint<R: ProgressReporter>(
        &self,
        run: &mut RunState,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        self.transition(reporter, ControllerState::Checkpointing);

        if !run.settled_positions.is_empty() {
            let positions = &run.settled_positions;
            self.with_store_retry("mark_processed", cancel, reporter, || {
                self.checkpoints.mark_processed(&self.key, positions)
            })
            .await?;
            run.settled_positions.clear();
        }

        let mut next = run.checkpoint.clone();
        next.advance(
            run.durable_end.unwrap_or(next.position),
            run.unsaved_written,
            run.meter.rate(),
            Utc::now(),
        );
        next.worker_id = Some(self.config.worker_id.clone());

        self.with_store_retry("save", cancel, reporter, || self.checkpoints.save(&next))
            .await?;

        run.checkpoint = next;
        run.unsaved_written = 0;
        reporter.report(HarvestEvent::CheckpointSaved {
            stream: &self.key,
            checkpoint: &run.checkpoint,
        });
        Ok(())
    }

    /// Flushes the rest of the cycle and wraps the checkpoint to the range start.
    async fn complete_cycle<R: ProgressReporter>(
        &self,
        run: &mut RunState,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        self.flush_and_checkpoint(run, cancel, reporter).await?;
        self.transition(reporter, ControllerState::CycleComplete);

        // Seen set first: a crash in between only repeats the cycle end.
        self.with_store_retry("clear_processed", cancel, reporter, || {
            self.checkpoints.clear_processed(&self.key)
        })
        .await?;

        let finished_cycle = run.checkpoint.cycle_count;
        let mut next = run.checkpoint.clone();
        next.complete_cycle(self.config.range.min, Utc::now());
        next.worker_id = Some(self.config.worker_id.clone());
        self.with_store_retry("save", cancel, reporter, || self.checkpoints.save(&next))
            .await?;
        run.checkpoint = next;
        run.completed_end = None;
        run.durable_end = None;
        run.summary.cycles_completed += 1;

        reporter.report(HarvestEvent::CycleCompleted {
            stream: &self.key,
            cycle: finished_cycle,
            total_processed: run.checkpoint.total_processed,
        });
        Ok(())
    }

    /// Retries a store operation until it succeeds.
    ///
    /// Every `flush_max_attempts` consecutive failures trip the circuit
    /// breaker and wait for its cooldown. Gives up only on fatal errors or
    /// when cancelled and the attempts are exhausted.
    async fn with_store_retry<T, F, Fut, R>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        reporter: &R,
        mut op: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
        R: ProgressReporter,
    {
        let breaker = self.pool.breaker();
        let mut attempt: u32 = 0;
        let mut tripped = false;

        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    if tripped {
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => e,
            };

            let message = error.to_string();
            reporter.report(HarvestEvent::StoreFailed {
                stream: &self.key,
                operation,
                attempt,
                error: &message,
            });

            if attempt % self.config.flush_max_attempts == 0 {
                if cancel.is_cancelled() {
                    return Err(error);
                }
                breaker.trip(&error);
                tripped = true;
                breaker.wait_until_closed(cancel).await;
                continue;
            }

            if cancel.is_cancelled() {
                sleep(self.config.flush_retry_delay).await;
            } else {
                tokio::select! {
                    _ = sleep(self.config.flush_retry_delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }

    fn report_breaker<R: ProgressReporter>(&self, run: &mut RunState, reporter: &R) {
        let stats = self.pool.breaker().stats();
        if stats.total_trips > run.breaker_trips {
            run.breaker_trips = stats.total_trips;
            run.breaker_open = true;
            reporter.report(HarvestEvent::BreakerOpened {
                stream: &self.key,
                cooldown: stats.cooldown_remaining.unwrap_or_default(),
            });
        } else if run.breaker_open && stats.state == CircuitState::Closed {
            run.breaker_open = false;
            reporter.report(HarvestEvent::BreakerClosed { stream: &self.key });
        }
    }

    fn transition<R: ProgressReporter>(&self, reporter: &R, state: ControllerState) {
        reporter.report(HarvestEvent::StateChanged {
            stream: &self.key,
            state,
        });
    }
}

//! Progress reporting for harvesting streams.
//!
//! The controller and the watchdog emit [`HarvestEvent`]s instead of logging
//! directly, so frontends decide how progress is rendered. The CLI uses
//! [`TracingReporter`]; tests use [`SilentReporter`] or a recording mock.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::controller::ControllerState;
use crate::models::{Checkpoint, Position, StreamKey};
use crate::position::PositionBlock;
use crate::stats::BlockStats;

// =============================================================================
// Harvest Events
// =============================================================================

/// Events emitted while a stream is being harvested.
#[derive(Debug, Clone)]
pub enum HarvestEvent<'a> {
    /// Controller resumed from a checkpoint.
    Resumed {
        stream: &'a StreamKey,
        position: Position,
        cycle: i64,
    },
    /// Controller moved to another state.
    StateChanged {
        stream: &'a StreamKey,
        state: ControllerState,
    },
    /// A block was fetched, parsed and staged.
    BlockFetched {
        stream: &'a StreamKey,
        block: PositionBlock,
        stats: &'a BlockStats,
    },
    /// A position could not be parsed.
    ParseFailed {
        stream: &'a StreamKey,
        position: Position,
        reason: &'a str,
    },
    /// Staged entities were written.
    Flushed {
        stream: &'a StreamKey,
        written: u64,
        elapsed: Duration,
    },
    /// A store operation failed and will be retried. Staged work is kept.
    StoreFailed {
        stream: &'a StreamKey,
        operation: &'a str,
        attempt: u32,
        error: &'a str,
    },
    /// Checkpoint saved after a durable flush.
    CheckpointSaved {
        stream: &'a StreamKey,
        checkpoint: &'a Checkpoint,
    },
    /// The whole range was processed.
    CycleCompleted {
        stream: &'a StreamKey,
        cycle: i64,
        total_processed: i64,
    },
    /// The circuit breaker paused fetching.
    BreakerOpened {
        stream: &'a StreamKey,
        cooldown: Duration,
    },
    /// The circuit breaker resumed normal fetching.
    BreakerClosed { stream: &'a StreamKey },
    /// The watchdog found a stale stream.
    StreamStale {
        stream: &'a StreamKey,
        age: Duration,
    },
    /// The watchdog restarted a stream.
    StreamRestarted { stream: &'a StreamKey },
    /// Controller stopped after cancellation.
    Shutdown {
        stream: &'a StreamKey,
        position: Position,
    },
    /// Controller stopped on a fatal error.
    Fatal {
        stream: &'a StreamKey,
        error: &'a str,
    },
}

// =============================================================================
// Progress Reporter Trait
// =============================================================================

/// Receiver of [`HarvestEvent`]s.
pub trait ProgressReporter: Send + Sync {
    /// Called for every event.
    ///
    /// The default implementation does nothing (silent mode).
    fn report(&self, event: HarvestEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Reporter that logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: HarvestEvent<'_>) {
        match event {
            HarvestEvent::Resumed {
                stream,
                position,
                cycle,
            } => {
                info!(stream = %stream, position, cycle, "Resuming stream");
            }
            HarvestEvent::StateChanged { stream, state } => {
                // Debug level to avoid spam
                debug!(stream = %stream, state = %state, "Controller state changed");
            }
            HarvestEvent::BlockFetched {
                stream,
                block,
                stats,
            } => {
                info!(
                    stream = %stream,
                    start = block.start,
                    end = block.end,
                    fetched = stats.fetched,
                    not_found = stats.not_found,
                    failed = stats.failed,
                    skipped = stats.skipped,
                    entities = stats.entities,
                    "Block harvested"
                );
            }
            HarvestEvent::ParseFailed {
                stream,
                position,
                reason,
            } => {
                warn!(stream = %stream, position, reason, "Payload could not be parsed");
            }
            HarvestEvent::Flushed {
                stream,
                written,
                elapsed,
            } => {
                info!(
                    stream = %stream,
                    written,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Flushed staged entities"
                );
            }
            HarvestEvent::StoreFailed {
                stream,
                operation,
                attempt,
                error,
            } => {
                warn!(stream = %stream, operation, attempt, error, "Store operation failed, will retry");
            }
            HarvestEvent::CheckpointSaved { stream, checkpoint } => {
                debug!(
                    stream = %stream,
                    position = checkpoint.position,
                    total_processed = checkpoint.total_processed,
                    "Checkpoint saved"
                );
            }
            HarvestEvent::CycleCompleted {
                stream,
                cycle,
                total_processed,
            } => {
                info!(stream = %stream, cycle, total_processed, "Cycle complete");
            }
            HarvestEvent::BreakerOpened { stream, cooldown } => {
                warn!(
                    stream = %stream,
                    cooldown_secs = cooldown.as_secs(),
                    "Circuit breaker open, fetching paused"
                );
            }
            HarvestEvent::BreakerClosed { stream } => {
                info!(stream = %stream, "Circuit breaker closed, fetching resumed");
            }
            HarvestEvent::StreamStale { stream, age } => {
                warn!(stream = %stream, age_secs = age.as_secs(), "Stream is stale");
            }
            HarvestEvent::StreamRestarted { stream } => {
                info!(stream = %stream, "Stream restarted by watchdog");
            }
            HarvestEvent::Shutdown { stream, position } => {
                info!(stream = %stream, position, "Stream stopped");
            }
            HarvestEvent::Fatal { stream, error } => {
                error!(stream = %stream, error, "Stream stopped on fatal error");
            }
        }
    }
}

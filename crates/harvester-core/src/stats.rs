//! Per-block statistics and throughput measurement.

use std::time::Duration;

use tokio::time::Instant;

use crate::models::FetchOutcome;

/// Statistics of one harvested block.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockStats {
    /// Positions that returned a payload.
    pub fetched: usize,
    pub not_found: usize,
    /// Positions that ended in a transient or permanent error.
    pub failed: usize,
    /// Positions already processed or claimed by another controller.
    pub skipped: usize,
    /// Payloads the parser rejected.
    pub parse_failed: usize,
    /// Entities staged from this block.
    pub entities: usize,
}

impl BlockStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the final outcome of one position.
    pub fn record(&mut self, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Success(_) => self.fetched += 1,
            FetchOutcome::NotFound => self.not_found += 1,
            _ => self.failed += 1,
        }
    }

    /// Positions for which a request was issued.
    pub fn attempted(&self) -> usize {
        self.fetched + self.not_found + self.failed
    }

    /// Positions covered by the block, including skipped ones.
    pub fn total(&self) -> usize {
        self.attempted() + self.skipped
    }
}

/// Positions-per-second over the lifetime of a controller.
#[derive(Debug, Clone)]
pub struct RateMeter {
    started: Instant,
    positions: u64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateMeter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            positions: 0,
        }
    }

    pub fn record(&mut self, positions: usize) {
        self.positions += positions as u64;
    }

    pub fn positions(&self) -> u64 {
        self.positions
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Observed rate, or 0 before any time has passed.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.positions as f64 / secs
        } else {
            0.0
        }
    }
}

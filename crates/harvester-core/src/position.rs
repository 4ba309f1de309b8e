//! Position generation.
//!
//! [`PositionGenerator`] turns a position range into contiguous blocks of
//! `block_size` positions. It has no side effects: it neither sleeps nor
//! touches a store, which keeps cycle logic testable on its own.
//!
//! Bounded ranges end when the next block would start beyond `range.max`.
//! Unbounded (paginated) ranges end after `empty_threshold` consecutive blocks
//! reported empty through [`PositionGenerator::record_block_items`].
//!
//! ```
//! use harvester_core::position::{PositionGenerator, Step};
//! use harvester_core::PositionRange;
//!
//! let mut generator = PositionGenerator::new(PositionRange::bounded(1, 100), 40, 1, 0).unwrap();
//! let mut blocks = Vec::new();
//! while let Step::Block(block) = generator.next_block() {
//!     blocks.push((block.start, block.end));
//! }
//! assert_eq!(blocks, vec![(1, 40), (41, 80), (81, 100)]);
//! ```

use std::ops::RangeInclusive;

use crate::error::AppError;
use crate::models::{Position, PositionRange};

/// Inclusive block of positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionBlock {
    pub start: Position,
    pub end: Position,
}

impl PositionBlock {
    pub fn positions(&self) -> RangeInclusive<Position> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// One step of the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Block(PositionBlock),
    /// The range is exhausted. The next call starts a new cycle.
    CycleComplete,
}

#[derive(Debug, Clone)]
pub struct PositionGenerator {
    range: PositionRange,
    block_size: i64,
    next_start: Position,
    cycle: i64,
    empty_threshold: u32,
    consecutive_empty: u32,
    completed: bool,
}

impl PositionGenerator {
    /// Creates a generator resuming at `resume_from` (inclusive) in cycle `cycle`.
    ///
    /// For unbounded ranges use [`PositionGenerator::paginated`].
    pub fn new(
        range: PositionRange,
        block_size: usize,
        resume_from: Position,
        cycle: i64,
    ) -> Result<Self, AppError> {
        Self::build(range, block_size, resume_from, cycle, 0)
    }

    /// Creates a generator over an unbounded, paginated range.
    pub fn paginated(
        min: Position,
        block_size: usize,
        resume_from: Position,
        cycle: i64,
        empty_threshold: u32,
    ) -> Result<Self, AppError> {
        if empty_threshold == 0 {
            return Err(AppError::ConfigError(
                "empty_page_threshold must be at least 1".to_string(),
            ));
        }
        Self::build(
            PositionRange::unbounded(min),
            block_size,
            resume_from,
            cycle,
            empty_threshold,
        )
    }

    fn build(
        range: PositionRange,
        block_size: usize,
        resume_from: Position,
        cycle: i64,
        empty_threshold: u32,
    ) -> Result<Self, AppError> {
        if block_size == 0 {
            return Err(AppError::ConfigError(
                "block_size must be at least 1".to_string(),
            ));
        }
        if let Some(max) = range.max {
            if max < range.min {
                return Err(AppError::ConfigError(format!(
                    "range_max ({}) is below range_min ({})",
                    max, range.min
                )));
            }
        }
        if range.max.is_none() && empty_threshold == 0 {
            return Err(AppError::ConfigError(
                "unbounded ranges need an empty_page_threshold".to_string(),
            ));
        }

        Ok(Self {
            range,
            block_size: block_size as i64,
            next_start: resume_from.max(range.min),
            cycle,
            empty_threshold,
            consecutive_empty: 0,
            completed: false,
        })
    }

    /// Produces the next block, or signals that the cycle is complete.
    pub fn next_block(&mut self) -> Step {
        if self.completed {
            self.restart();
        }

        if self.is_exhausted() {
            self.completed = true;
            return Step::CycleComplete;
        }

        let start = self.next_start;
        let mut end = start.saturating_add(self.block_size - 1);
        if let Some(max) = self.range.max {
            end = end.min(max);
        }
        self.next_start = end.saturating_add(1);

        Step::Block(PositionBlock { start, end })
    }

    /// Reports how many items the last block produced. Only meaningful for
    /// paginated ranges; bounded ranges ignore it.
    pub fn record_block_items(&mut self, items: usize) {
        if self.range.is_bounded() {
            return;
        }
        if items == 0 {
            self.consecutive_empty += 1;
        } else {
            self.consecutive_empty = 0;
        }
    }

    /// Rewinds to the start of the range and begins the next cycle.
    pub fn restart(&mut self) {
        self.next_start = self.range.min;
        self.consecutive_empty = 0;
        self.cycle += 1;
        self.completed = false;
    }

    fn is_exhausted(&self) -> bool {
        match self.range.max {
            Some(max) => self.next_start > max,
            None => self.consecutive_empty >= self.empty_threshold,
        }
    }

    pub fn cycle(&self) -> i64 {
        self.cycle
    }

    pub fn next_start(&self) -> Position {
        self.next_start
    }

    pub fn range(&self) -> PositionRange {
        self.range
    }
}

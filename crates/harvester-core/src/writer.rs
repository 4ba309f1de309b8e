//! Bulk persistence of staged batches.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;
use crate::models::UpdateMode;
use crate::staging::StagedBatch;
use crate::traits::EntityStore;

/// Rows written per kind, in write order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushCounts {
    pub per_kind: Vec<(String, u64)>,
}

impl FlushCounts {
    pub fn record(&mut self, kind: impl Into<String>, written: u64) {
        self.per_kind.push((kind.into(), written));
    }

    pub fn total(&self) -> u64 {
        self.per_kind.iter().map(|(_, n)| n).sum()
    }

    pub fn for_kind(&self, kind: &str) -> u64 {
        self.per_kind
            .iter()
            .filter(|(k, _)| k == kind)
            .map(|(_, n)| n)
            .sum()
    }
}

/// Result of one successful flush.
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub counts: FlushCounts,
    pub generation: u64,
    pub elapsed: Duration,
}

impl FlushReport {
    pub fn written(&self) -> u64 {
        self.counts.total()
    }
}

/// Writes staged batches through an [`EntityStore`].
#[derive(Clone)]
pub struct BulkWriter<S: EntityStore> {
    store: S,
    mode: UpdateMode,
}

impl<S: EntityStore> BulkWriter<S> {
    pub fn new(store: S, mode: UpdateMode) -> Self {
        Self { store, mode }
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    /// Persists a batch in one transaction.
    ///
    /// On error nothing was committed and the caller still owns the batch,
    /// so the same snapshot can be flushed again.
    pub async fn flush(&self, source: &str, batch: &StagedBatch) -> Result<FlushReport, AppError> {
        let started = Instant::now();
        if batch.is_empty() {
            return Ok(FlushReport {
                counts: FlushCounts::default(),
                generation: batch.generation,
                elapsed: started.elapsed(),
            });
        }

        let counts = self.store.write_batch(source, batch, self.mode).await?;
        let elapsed = started.elapsed();

        tracing::debug!(
            source,
            generation = batch.generation,
            entities = batch.len(),
            written = counts.total(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch flushed"
        );

        Ok(FlushReport {
            counts,
            generation: batch.generation,
            elapsed,
        })
    }
}

//! In-memory checkpoint store.
//!
//! Backs dry runs (`harvester run --dry-run`) and tests. Durable backends
//! live in `harvester-db`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;
use crate::models::{Checkpoint, Position, StreamKey};
use crate::traits::CheckpointStore;

/// Default lease of a claim taken by `filter_unprocessed`.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(600);

#[derive(Default)]
struct MemoryState {
    checkpoints: BTreeMap<StreamKey, Checkpoint>,
    seen: HashMap<StreamKey, HashSet<Position>>,
    claims: HashMap<StreamKey, HashMap<Position, (String, Instant)>>,
    history: Vec<Checkpoint>,
}

#[derive(Clone)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<MemoryState>>,
    claim_ttl: Duration,
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every checkpoint ever saved, oldest first.
    pub fn history(&self) -> Vec<Checkpoint> {
        self.lock().history.clone()
    }

    pub fn is_processed(&self, key: &StreamKey, position: Position) -> bool {
        self.lock()
            .seen
            .get(key)
            .is_some_and(|seen| seen.contains(&position))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &StreamKey) -> Result<Option<Checkpoint>, AppError> {
        Ok(self.lock().checkpoints.get(key).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        let mut state = self.lock();
        state
            .checkpoints
            .insert(checkpoint.key(), checkpoint.clone());
        state.history.push(checkpoint.clone());
        Ok(())
    }

    async fn filter_unprocessed(
        &self,
        key: &StreamKey,
        ids: &[Position],
        owner: &str,
    ) -> Result<Vec<Position>, AppError> {
        let now = Instant::now();
        let ttl = self.claim_ttl;
        let mut state = self.lock();
        let state = &mut *state;

        let seen = state.seen.entry(key.clone()).or_default();
        let claims = state.claims.entry(key.clone()).or_default();

        let mut claimed = Vec::with_capacity(ids.len());
        for &id in ids {
            if seen.contains(&id) {
                continue;
            }
            let available = match claims.get(&id) {
                Some((holder, at)) => holder == owner || now.duration_since(*at) >= ttl,
                None => true,
            };
            if available {
                claims.insert(id, (owner.to_string(), now));
                claimed.push(id);
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, key: &StreamKey, ids: &[Position]) -> Result<u64, AppError> {
        let mut state = self.lock();
        let state = &mut *state;

        let seen = state.seen.entry(key.clone()).or_default();
        let claims = state.claims.entry(key.clone()).or_default();
        let mut marked = 0;
        for &id in ids {
            claims.remove(&id);
            if seen.insert(id) {
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn clear_processed(&self, key: &StreamKey) -> Result<u64, AppError> {
        let mut state = self.lock();
        state.claims.remove(key);
        Ok(state
            .seen
            .remove(key)
            .map(|seen| seen.len() as u64)
            .unwrap_or(0))
    }

    async fn processed_count(&self, key: &StreamKey) -> Result<u64, AppError> {
        Ok(self
            .lock()
            .seen
            .get(key)
            .map(|seen| seen.len() as u64)
            .unwrap_or(0))
    }

    async fn delete(&self, key: &StreamKey) -> Result<bool, AppError> {
        let mut state = self.lock();
        state.seen.remove(key);
        state.claims.remove(key);
        Ok(state.checkpoints.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, AppError> {
        Ok(self.lock().checkpoints.values().cloned().collect())
    }
}

//! Staging buffer between parsing and persistence.
//!
//! Entities are deduplicated by `(kind, id)` with last-write-wins semantics.
//! [`StagingBuffer::drain`] hands the whole content to the writer as a
//! [`StagedBatch`] grouped by kind, with referenced kinds ordered before the
//! kinds that reference them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::Entity;

/// Returned by [`StagingBuffer::stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSignal {
    Accepted,
    /// The buffer reached its cap; the caller must flush before staging more.
    FlushRequested,
}

/// Entities of one kind inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct KindBatch {
    pub kind: String,
    pub entities: Vec<Entity>,
}

/// Immutable snapshot produced by [`StagingBuffer::drain`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedBatch {
    /// Kinds in write order.
    pub kinds: Vec<KindBatch>,
    /// Buffer generation this batch was drained from.
    pub generation: u64,
}

impl StagedBatch {
    pub fn len(&self) -> usize {
        self.kinds.iter().map(|k| k.entities.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.iter().all(|k| k.entities.is_empty())
    }

    pub fn kind_names(&self) -> Vec<&str> {
        self.kinds.iter().map(|k| k.kind.as_str()).collect()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.kinds.iter().flat_map(|k| k.entities.iter())
    }
}

pub struct StagingBuffer {
    entries: HashMap<(String, String), Entity>,
    cap: usize,
    generation: u64,
    kind_order: Vec<String>,
}

impl StagingBuffer {
    /// Creates a buffer holding at most `cap` entities.
    ///
    /// `kind_order` is the declared preference used to break ties between
    /// independent kinds and as the fallback when references form a cycle.
    pub fn new(cap: usize, kind_order: Vec<String>) -> Self {
        Self {
            entries: HashMap::new(),
            cap: cap.max(1),
            generation: 0,
            kind_order,
        }
    }

    /// Inserts or overwrites an entity.
    pub fn stage(&mut self, entity: Entity) -> StageSignal {
        self.entries.insert(entity.key(), entity);
        if self.is_full() {
            StageSignal::FlushRequested
        } else {
            StageSignal::Accepted
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.cap
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Whether `count` more entities fit without exceeding the cap.
    pub fn has_room_for(&self, count: usize) -> bool {
        self.entries.len() + count <= self.cap
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Takes every staged entity and starts a new generation.
    pub fn drain(&mut self) -> StagedBatch {
        let generation = self.generation;
        self.generation += 1;

        let mut by_kind: BTreeMap<String, Vec<Entity>> = BTreeMap::new();
        for (_, entity) in self.entries.drain() {
            by_kind.entry(entity.kind.clone()).or_default().push(entity);
        }

        let order = dependency_order(&by_kind, &self.kind_order);
        let kinds = order
            .into_iter()
            .filter_map(|kind| {
                by_kind.remove(&kind).map(|mut entities| {
                    entities.sort_by(|a, b| a.id.cmp(&b.id));
                    KindBatch { kind, entities }
                })
            })
            .collect();

        StagedBatch { kinds, generation }
    }

    /// Puts back a batch whose flush failed. Entities staged since the drain
    /// are newer and are kept.
    pub fn restore(&mut self, batch: StagedBatch) {
        for entity in batch.kinds.into_iter().flat_map(|k| k.entities) {
            self.entries.entry(entity.key()).or_insert(entity);
        }
    }
}

/// Orders kinds so that every referenced kind precedes its referencing kinds.
fn dependency_order(by_kind: &BTreeMap<String, Vec<Entity>>, declared: &[String]) -> Vec<String> {
    let rank = |kind: &str| {
        declared
            .iter()
            .position(|k| k == kind)
            .unwrap_or(declared.len())
    };

    // Edges parent -> child, restricted to kinds present in the batch.
    let mut children: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = by_kind.keys().map(|k| (k.as_str(), 0)).collect();

    for (kind, entities) in by_kind {
        for parent in entities.iter().flat_map(|e| e.references.iter()) {
            let parent = parent.kind.as_str();
            if parent == kind.as_str() || !by_kind.contains_key(parent) {
                continue;
            }
            if children.entry(parent).or_default().insert(kind.as_str()) {
                *in_degree.entry(kind.as_str()).or_default() += 1;
            }
        }
    }

    let mut ready: BTreeSet<(usize, &str)> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(kind, _)| (rank(*kind), *kind))
        .collect();
    let mut order = Vec::with_capacity(by_kind.len());

    while let Some(next) = ready.pop_first() {
        let kind = next.1;
        order.push(kind.to_string());
        if let Some(dependents) = children.get(kind) {
            for &child in dependents {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((rank(child), child));
                    }
                }
            }
        }
    }

    if order.len() < by_kind.len() {
        tracing::warn!(
            kinds = ?by_kind.keys().collect::<Vec<_>>(),
            "Entity references form a cycle, falling back to declared kind order"
        );
        let mut fallback: Vec<&String> = by_kind.keys().collect();
        fallback.sort_by(|a, b| rank(a.as_str()).cmp(&rank(b.as_str())).then_with(|| a.cmp(b)));
        return fallback.into_iter().cloned().collect();
    }

    order
}

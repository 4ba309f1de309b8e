//! Domain models shared by every harvester component.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

/// Logical cursor into a source: a product id for dense id ranges, a page
/// number for paginated listings.
pub type Position = i64;

// =============================================================================
// Streams and ranges
// =============================================================================

/// Identifies one harvesting stream: a source and one of its position spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub source: String,
    pub stream: String,
}

impl StreamKey {
    pub fn new(source: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.stream)
    }
}

/// Inclusive position range of a stream. `max = None` means the source is
/// paginated and the end is discovered by running into empty pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRange {
    pub min: Position,
    pub max: Option<Position>,
}

impl PositionRange {
    pub fn bounded(min: Position, max: Position) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub fn unbounded(min: Position) -> Self {
        Self { min, max: None }
    }

    pub fn is_bounded(&self) -> bool {
        self.max.is_some()
    }

    /// Number of positions in a bounded range.
    pub fn len(&self) -> Option<u64> {
        self.max
            .map(|max| if max < self.min { 0 } else { (max - self.min + 1) as u64 })
    }
}

// =============================================================================
// Fetch results
// =============================================================================

/// Raw response body for one position, as returned by a source client.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub body: String,
    pub content_type: Option<String>,
    pub status: u16,
}

impl RawPayload {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
            status: 200,
        }
    }

    pub fn json_payload(value: &Value) -> Self {
        Self {
            body: value.to_string(),
            content_type: Some("application/json".to_string()),
            status: 200,
        }
    }

    /// Decodes the body as JSON.
    pub fn json(&self) -> Result<Value, AppError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Final classification of one position after retries.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(RawPayload),
    NotFound,
    RateLimited,
    Timeout,
    TransientError(String),
    PermanentError(String),
}

impl FetchOutcome {
    /// Maps a client error to the outcome recorded for the position.
    pub fn from_error(error: &AppError) -> Self {
        match error {
            AppError::NotFound(_) => FetchOutcome::NotFound,
            AppError::RateLimitExceeded(_) => FetchOutcome::RateLimited,
            AppError::Timeout(_) => FetchOutcome::Timeout,
            e if e.is_retryable() => FetchOutcome::TransientError(e.to_string()),
            e => FetchOutcome::PermanentError(e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchOutcome::NotFound)
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchOutcome::RateLimited | FetchOutcome::Timeout | FetchOutcome::TransientError(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchOutcome::PermanentError(_))
    }

    /// Whether this outcome increments the consecutive error counter.
    /// Not-found is neutral: sparse id spaces are mostly holes.
    pub fn counts_toward_breaker(&self) -> bool {
        self.is_transient() || self.is_permanent()
    }

    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::RateLimited => "rate_limited",
            FetchOutcome::Timeout => "timeout",
            FetchOutcome::TransientError(_) => "transient_error",
            FetchOutcome::PermanentError(_) => "permanent_error",
        }
    }
}

/// Result of fetching one position.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub position: Position,
    pub fetched_at: DateTime<Utc>,
    pub attempts: u32,
    pub outcome: FetchOutcome,
}

// =============================================================================
// Entities
// =============================================================================

/// Reference from one entity to another (e.g. product → seller).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: String,
    pub id: String,
}

/// A normalized record extracted from a payload.
///
/// `(kind, id)` is the natural key. References define the write order: the
/// referenced kind is always persisted before the referencing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub id: String,
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub references: Vec<EntityRef>,
}

impl Entity {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            fields: Map::new(),
            references: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_reference(mut self, kind: impl Into<String>, id: impl Into<String>) -> Self {
        self.references.push(EntityRef {
            kind: kind.into(),
            id: id.into(),
        });
        self
    }

    /// Natural key of the entity.
    pub fn key(&self) -> (String, String) {
        (self.kind.clone(), self.id.clone())
    }
}

/// How an upsert treats fields that are absent or null in the new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Null or absent fields never overwrite a known value.
    #[default]
    Additive,
    /// The stored record is replaced by the new one.
    Replace,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Additive => write!(f, "additive"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

impl FromStr for UpdateMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "additive" => Ok(Self::Additive),
            "replace" => Ok(Self::Replace),
            _ => Err(AppError::ConfigError(format!(
                "Unknown update mode: '{}'. Valid options: additive, replace",
                s
            ))),
        }
    }
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Durable progress marker of one stream.
///
/// `position` is the last position known to be durably processed; a restart
/// resumes there inclusively, so at most one block is fetched twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: String,
    pub stream: String,
    pub position: Position,
    pub cycle_count: i64,
    pub total_processed: i64,
    pub last_updated_at: DateTime<Utc>,
    /// Positions per second observed over the controller's lifetime.
    pub observed_rate: f64,
    /// Identity of the controller that wrote the checkpoint.
    pub worker_id: Option<String>,
}

impl Checkpoint {
    /// A fresh checkpoint at the start of the range.
    pub fn new(key: &StreamKey, range_min: Position, now: DateTime<Utc>) -> Self {
        Self {
            source: key.source.clone(),
            stream: key.stream.clone(),
            position: range_min,
            cycle_count: 0,
            total_processed: 0,
            last_updated_at: now,
            observed_rate: 0.0,
            worker_id: None,
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.source.clone(), self.stream.clone())
    }

    /// Records durable progress up to `position`.
    pub fn advance(
        &mut self,
        position: Position,
        written: u64,
        observed_rate: f64,
        now: DateTime<Utc>,
    ) {
        self.position = self.position.max(position);
        self.total_processed = self.total_processed.saturating_add(written as i64);
        self.observed_rate = observed_rate;
        self.last_updated_at = now;
    }

    /// Wraps the checkpoint to the start of the range for the next cycle.
    pub fn complete_cycle(&mut self, range_min: Position, now: DateTime<Utc>) {
        self.cycle_count += 1;
        self.position = range_min;
        self.last_updated_at = now;
    }

    /// Rejects checkpoints that cannot have been written by a healthy controller.
    pub fn validate(&self, range: &PositionRange) -> Result<(), AppError> {
        if self.cycle_count < 0 {
            return Err(AppError::CorruptCheckpoint(format!(
                "{}/{}: negative cycle_count {}",
                self.source, self.stream, self.cycle_count
            )));
        }
        if self.total_processed < 0 {
            return Err(AppError::CorruptCheckpoint(format!(
                "{}/{}: negative total_processed {}",
                self.source, self.stream, self.total_processed
            )));
        }
        if self.position < range.min {
            return Err(AppError::CorruptCheckpoint(format!(
                "{}/{}: position {} below range start {}",
                self.source, self.stream, self.position, range.min
            )));
        }
        if !self.observed_rate.is_finite() || self.observed_rate < 0.0 {
            return Err(AppError::CorruptCheckpoint(format!(
                "{}/{}: invalid observed_rate {}",
                self.source, self.stream, self.observed_rate
            )));
        }
        Ok(())
    }
}

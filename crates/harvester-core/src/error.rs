use std::time::Duration;

use thiserror::Error;

/// Application-wide error types.
///
/// This enum represents every failure the harvester can observe, from a single
/// upstream request up to the persistence layer. It uses the `thiserror` crate
/// for ergonomic error handling and automatic conversion from underlying
/// library errors.
///
/// # Error Conversion
///
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Classification
///
/// Errors fall into four groups that drive the engine's reaction:
///
/// | Group | Examples | Reaction |
/// |-------|----------|----------|
/// | item-level | [`AppError::NotFound`], [`AppError::ParseError`] | logged, skipped, never retried |
/// | transient | [`AppError::Timeout`], [`AppError::ServerError`] | retried with backoff |
/// | systemic | [`AppError::Blocked`], repeated transient errors | circuit breaker opens |
/// | fatal | [`AppError::ConfigError`], [`AppError::CorruptCheckpoint`] | controller stops |
///
/// ```
/// use harvester_core::error::AppError;
///
/// let err = AppError::ServerError(503);
/// assert!(err.is_retryable());
/// assert!(!err.is_fatal());
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// Wraps all errors from SQLx, including connection failures, query
    /// errors and constraint violations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// HTTP client request failed for a reason not covered by a more specific variant.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A URL or URL template could not be built.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The requested position does not exist upstream (404, 410 or missing marker).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded (HTTP 429).
    ///
    /// Carries the server-provided `Retry-After` delay when present.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded(Option<Duration>),

    /// Upstream returned a 5xx status.
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// The session used to authenticate against the source has expired.
    #[error("Session expired")]
    SessionExpired,

    /// The source is actively refusing service (403, captcha page, block marker).
    #[error("Blocked by source: {0}")]
    Blocked(String),

    /// A payload could not be turned into entities.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A persistence backend (checkpoint store, Redis) could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored checkpoint is unreadable or violates its invariants.
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// Configuration file or runtime configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Try: docker-compose up -d".to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!(
                    "Request timed out after {} seconds.\n   The source may be overloaded. Try again later.",
                    secs
                )
            }
            AppError::RateLimitExceeded(_) => {
                "Too many requests. Lower `concurrency` for this source or wait a moment."
                    .to_string()
            }
            AppError::SessionExpired => {
                "The source session expired.\n   Refresh the session cookie and restart the stream."
                    .to_string()
            }
            AppError::Blocked(reason) => {
                format!(
                    "The source is blocking requests: {}\n   Lower concurrency or raise backoff_base_secs.",
                    reason
                )
            }
            AppError::StoreUnavailable(msg) => {
                format!(
                    "Checkpoint store unavailable: {}\n   Check DATABASE_URL / REDIS_URL.",
                    msg
                )
            }
            AppError::CorruptCheckpoint(msg) => {
                format!(
                    "Checkpoint is corrupt: {}\n   Inspect it with `harvester status` or reset it with `harvester reset`.",
                    msg
                )
            }
            AppError::ConfigError(msg) => {
                format!(
                    "Configuration error: {}\n   Check your configuration file.",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is transient and the request may be retried.
    ///
    /// ```
    /// use harvester_core::error::AppError;
    ///
    /// assert!(AppError::NetworkError("connection reset".to_string()).is_retryable());
    /// assert!(AppError::RateLimitExceeded(None).is_retryable());
    /// assert!(!AppError::NotFound("42".to_string()).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded(_)
                | AppError::ServerError(_)
                | AppError::SessionExpired
                | AppError::ClientError(_)
                | AppError::StoreUnavailable(_)
        )
    }

    /// Returns true if this error concerns one item only.
    ///
    /// Item-level errors are logged and skipped; they never affect the
    /// circuit breaker.
    pub fn is_item_level(&self) -> bool {
        matches!(self, AppError::NotFound(_) | AppError::ParseError(_))
    }

    /// Returns true if this error should count toward the circuit breaker.
    ///
    /// Transient and systemic errors trip the circuit; item-level and fatal
    /// errors do not.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded(_)
            | AppError::ServerError(_)
            | AppError::SessionExpired
            | AppError::Blocked(_)
            | AppError::StoreUnavailable(_)
            | AppError::DatabaseError(_) => true,

            AppError::ClientError(msg) => {
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connect")
                    || msg.contains("connection")
            }

            AppError::SerializationError(_)
            | AppError::InvalidUrl(_)
            | AppError::NotFound(_)
            | AppError::ParseError(_)
            | AppError::CorruptCheckpoint(_)
            | AppError::ConfigError(_)
            | AppError::Generic(_) => false,
        }
    }

    /// Returns true if the controller must stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::ConfigError(_) | AppError::CorruptCheckpoint(_) | AppError::InvalidUrl(_)
        )
    }

    /// Returns true for rate limiting, which lengthens the breaker cooldown.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AppError::RateLimitExceeded(_))
    }
}

//! Circuit breaker guarding a source against hammering while it misbehaves.
//!
//! One breaker exists per stream. The fetch pool records the final outcome of
//! every position; the breaker counts consecutive transient or permanent
//! failures (not-found is neutral) and opens once the count reaches
//! `failure_threshold`. While open, no new fetch starts; in-flight fetches are
//! left alone.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (paused) --[cooldown]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure, cooldown x2]--       |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```
//!
//! Cooldowns start at `recovery_timeout`, double on every consecutive trip
//! and never exceed `max_recovery_timeout`. Rate limiting applies
//! `rate_limit_backoff_multiplier` on top.
//!
//! # Example
//!
//! ```ignore
//! use harvester_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let cb = CircuitBreaker::new("uzum/products", CircuitBreakerConfig::default());
//!
//! if !cb.wait_until_closed(&cancel).await {
//!     return; // cancelled while paused
//! }
//! let result = pool.fetch_one(position).await;
//! cb.record_outcome(&result.outcome);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::env_parse;
use crate::error::AppError;
use crate::models::FetchOutcome;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - new requests wait for the cooldown.
    Open,
    /// Circuit is half-open - requests probe whether the source recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Number of successful requests in half-open state to close the circuit.
    pub success_threshold: u32,

    /// Cooldown of the first trip.
    pub recovery_timeout: Duration,

    /// When rate limit (429) is detected, multiply the cooldown by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Upper bound for every cooldown.
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    /// Applies `CB_*` environment overrides on top of this configuration.
    ///
    /// Supported: `CB_FAILURE_THRESHOLD`, `CB_SUCCESS_THRESHOLD`,
    /// `CB_RECOVERY_TIMEOUT_SECS`, `CB_MAX_RECOVERY_TIMEOUT_SECS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("CB_FAILURE_THRESHOLD") {
            self.failure_threshold = v;
        }
        if let Some(v) = env_parse("CB_SUCCESS_THRESHOLD") {
            self.success_threshold = v;
        }
        if let Some(secs) = env_parse("CB_RECOVERY_TIMEOUT_SECS") {
            self.recovery_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CB_MAX_RECOVERY_TIMEOUT_SECS") {
            self.max_recovery_timeout = Duration::from_secs(secs);
        }
        self
    }
}

/// Mutable breaker state, guarded by one mutex.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    paused_at: Option<Instant>,
    cooldown: Duration,
    last_error: Option<String>,
    /// Trips since the circuit was last closed by a success.
    trip_streak: u32,
    total_trips: u64,
}

impl BreakerState {
    fn closed(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_successes: 0,
            paused_at: None,
            cooldown: config.recovery_timeout,
            last_error: None,
            trip_streak: 0,
            total_trips: 0,
        }
    }

    fn cooldown_remaining(&self) -> Duration {
        match self.paused_at {
            Some(t) => self.cooldown.saturating_sub(t.elapsed()),
            None => self.cooldown,
        }
    }

    /// Open becomes half-open lazily, on the first look after the cooldown.
    fn refresh(&mut self, name: &str) {
        if self.state == CircuitState::Open && self.cooldown_remaining().is_zero() {
            tracing::info!(circuit = %name, "Cooldown elapsed, probing source");
            self.state = CircuitState::HalfOpen;
            self.probe_successes = 0;
            self.consecutive_failures = 0;
        }
    }

    fn pause(&mut self, config: &CircuitBreakerConfig, rate_limited: bool) {
        let base = if self.trip_streak == 0 {
            config.recovery_timeout
        } else {
            self.cooldown.saturating_mul(2)
        };
        let cooldown = if rate_limited {
            base.mul_f32(config.rate_limit_backoff_multiplier)
        } else {
            base
        };

        self.cooldown = cooldown.min(config.max_recovery_timeout);
        self.state = CircuitState::Open;
        self.paused_at = Some(Instant::now());
        self.trip_streak += 1;
        self.total_trips += 1;
    }

    fn close(&mut self, config: &CircuitBreakerConfig) {
        let total_trips = self.total_trips;
        *self = Self::closed(config);
        self.total_trips = total_trips;
    }
}

/// Snapshot of a breaker, for logging and events.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Successful probes while half-open.
    pub probe_successes: u32,
    pub last_error: Option<String>,
    /// Time left before probing starts, while open.
    pub cooldown_remaining: Option<Duration>,
    /// Times the circuit opened since creation.
    pub total_trips: u64,
}

/// Circuit breaker shared by all fetch workers of a stream.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let state = BreakerState::closed(&config);
        Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locks and refreshes the state.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refresh(&self.name);
        state
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            probe_successes: state.probe_successes,
            last_error: state.last_error.clone(),
            cooldown_remaining: (state.state == CircuitState::Open)
                .then(|| state.cooldown_remaining()),
            total_trips: state.total_trips,
        }
    }

    /// Waits until new requests may start.
    ///
    /// Returns `false` if the token was cancelled while waiting.
    pub async fn wait_until_closed(&self, cancel: &CancellationToken) -> bool {
        loop {
            let remaining = {
                let state = self.lock();
                if state.state != CircuitState::Open {
                    return true;
                }
                state.cooldown_remaining()
            };

            tokio::select! {
                _ = tokio::time::sleep(remaining.max(Duration::from_millis(1))) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Records the final outcome of one position.
    ///
    /// Returns the new state when this outcome caused a transition.
    pub fn record_outcome(&self, outcome: &FetchOutcome) -> Option<CircuitState> {
        match outcome {
            FetchOutcome::Success(_) => self.record_success(),
            FetchOutcome::NotFound => None,
            FetchOutcome::RateLimited => self.record_failure(&AppError::RateLimitExceeded(None)),
            FetchOutcome::Timeout => self.record_failure(&AppError::Timeout(0)),
            FetchOutcome::TransientError(msg) => {
                self.record_failure(&AppError::NetworkError(msg.clone()))
            }
            FetchOutcome::PermanentError(msg) => {
                self.record_failure(&AppError::Blocked(msg.clone()))
            }
        }
    }

    pub fn record_success(&self) -> Option<CircuitState> {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                state.probe_successes += 1;
                if state.probe_successes < self.config.success_threshold {
                    return None;
                }
                tracing::info!(
                    circuit = %self.name,
                    probes = state.probe_successes,
                    "Source recovered, resuming fetches"
                );
                state.close(&self.config);
                Some(CircuitState::Closed)
            }
            // Late result of a request that started before the pause.
            CircuitState::Open => None,
        }
    }

    pub fn record_failure(&self, error: &AppError) -> Option<CircuitState> {
        let mut state = self.lock();
        state.last_error = Some(error.to_string());

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures < self.config.failure_threshold {
                    return None;
                }
                state.pause(&self.config, error.is_rate_limit());
                tracing::warn!(
                    circuit = %self.name,
                    failures = state.consecutive_failures,
                    cooldown_secs = state.cooldown.as_secs(),
                    error = %error,
                    "Too many consecutive failures, pausing fetches"
                );
                Some(CircuitState::Open)
            }
            CircuitState::HalfOpen => {
                state.pause(&self.config, error.is_rate_limit());
                tracing::warn!(
                    circuit = %self.name,
                    cooldown_secs = state.cooldown.as_secs(),
                    trip_streak = state.trip_streak,
                    error = %error,
                    "Probe failed, pausing again"
                );
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    /// Forces the circuit open, e.g. after repeated persistence failures.
    pub fn trip(&self, error: &AppError) {
        let mut state = self.lock();
        if state.state == CircuitState::Open {
            return;
        }
        state.last_error = Some(error.to_string());
        state.pause(&self.config, error.is_rate_limit());
        tracing::warn!(
            circuit = %self.name,
            cooldown_secs = state.cooldown.as_secs(),
            error = %error,
            "Circuit breaker tripped"
        );
    }

    /// Closes the circuit and forgets every counter.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = BreakerState::closed(&self.config);
        tracing::info!(circuit = %self.name, "Circuit breaker reset");
    }
}

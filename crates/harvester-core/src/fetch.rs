//! Bounded-concurrency fetch pool.
//!
//! [`FetchPool`] requests a list of positions from a [`SourceClient`] with at
//! most `concurrency` requests in flight, applies a per-request timeout,
//! retries transient failures and feeds every final outcome to the stream's
//! [`CircuitBreaker`]. Results are yielded in completion order.
//!
//! # Retry policy
//!
//! | Error | Outcome | Retry |
//! |-------|---------|-------|
//! | `NotFound` | `NotFound` | never |
//! | `RateLimitExceeded` | `RateLimited` | `Retry-After`, else `base * 2^attempt` with jitter |
//! | `Timeout`, `ServerError`, `NetworkError` | transient | `base * attempt` |
//! | `SessionExpired` | transient | after `SourceClient::on_session_expired` |
//! | `Blocked` and other permanent errors | `PermanentError` | never |
//!
//! Every delay is capped at `max_delay`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::AppError;
use crate::models::{FetchOutcome, FetchResult, Position};
use crate::traits::SourceClient;

/// Retry behavior for a single position.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per position, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given the error of attempt `attempt`.
    pub fn delay_for(&self, error: &AppError, attempt: u32) -> Duration {
        let delay = match error {
            AppError::RateLimitExceeded(Some(retry_after)) => *retry_after,
            AppError::RateLimitExceeded(None) => {
                let exp = self
                    .base_delay
                    .saturating_mul(2_u32.saturating_pow(attempt));
                let jitter_ms = (exp.as_millis() as u64 / 4).max(1);
                exp + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
            }
            _ => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }
}

/// Configuration of a fetch pool.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Random pause of up to this long before each request.
    pub request_jitter: Option<Duration>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            request_jitter: None,
        }
    }
}

impl FetchConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_jitter(mut self, jitter: Option<Duration>) -> Self {
        self.request_jitter = jitter.filter(|j| !j.is_zero());
        self
    }
}

/// Fetches positions through a source client.
#[derive(Clone)]
pub struct FetchPool<C: SourceClient> {
    client: C,
    config: FetchConfig,
    breaker: CircuitBreaker,
    permits: Arc<Semaphore>,
}

impl<C: SourceClient> FetchPool<C> {
    pub fn new(client: C, config: FetchConfig, breaker: CircuitBreaker) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            client,
            permits: Arc::new(Semaphore::new(concurrency)),
            config,
            breaker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetches `positions`, yielding results as they complete.
    ///
    /// Positions not yet started when `cancel` fires are omitted from the
    /// stream; in-flight requests finish or time out.
    pub fn fetch_positions<'a>(
        &'a self,
        positions: Vec<Position>,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = FetchResult> + Send + 'a {
        stream::iter(positions)
            .map(move |position| self.fetch_one(position, cancel))
            .buffer_unordered(self.config.concurrency.max(1))
            .filter_map(|result| async move { result })
    }

    /// Fetches one position with retries. Returns `None` if cancelled before
    /// the first request was sent.
    pub async fn fetch_one(
        &self,
        position: Position,
        cancel: &CancellationToken,
    ) -> Option<FetchResult> {
        if !self.breaker.wait_until_closed(cancel).await {
            return None;
        }

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.ok()?,
            _ = cancel.cancelled() => return None,
        };
        if cancel.is_cancelled() {
            return None;
        }

        if let Some(jitter) = self.config.request_jitter {
            let pause_ms = rand::rng().random_range(0..=jitter.as_millis() as u64);
            sleep(Duration::from_millis(pause_ms)).await;
        }

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let error = match timeout(self.config.request_timeout, self.client.fetch(position)).await
            {
                Ok(Ok(payload)) => break FetchOutcome::Success(payload),
                Ok(Err(e)) => e,
                Err(_) => AppError::Timeout(self.config.request_timeout.as_secs()),
            };

            if !error.is_retryable() || attempts >= self.config.retry.max_attempts {
                break FetchOutcome::from_error(&error);
            }

            if matches!(error, AppError::SessionExpired) {
                if let Err(e) = self.client.on_session_expired().await {
                    tracing::warn!(position, error = %e, "Session could not be refreshed");
                    break FetchOutcome::from_error(&error);
                }
            }

            let delay = self.config.retry.delay_for(&error, attempts);
            tracing::debug!(
                position,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying position"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => break FetchOutcome::from_error(&error),
            }

            // Other positions may have opened the breaker in the meantime.
            if !self.breaker.wait_until_closed(cancel).await {
                break FetchOutcome::from_error(&error);
            }
        };

        self.breaker.record_outcome(&outcome);

        Some(FetchResult {
            position,
            fetched_at: Utc::now(),
            attempts,
            outcome,
        })
    }
}

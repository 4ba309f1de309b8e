//! Watchdog and supervisor for long-running stream controllers.
//!
//! The [`Supervisor`] owns one controller task per stream. The [`Watchdog`]
//! periodically reads every checkpoint and restarts streams whose checkpoint
//! has not moved for longer than their staleness threshold:
//!
//! ```text
//! loop {
//!     1. list checkpoints
//!     2. classify each watched stream (running / stale / not started)
//!     3. start missing streams, restart stale ones
//!     4. sleep poll_interval (cancellable)
//! }
//! ```
//!
//! Restarts are idempotent: a controller started less than the staleness
//! threshold ago is left alone, so two polls close together never restart the
//! same stream twice.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchdogConfig;
use crate::controller::ControllerSummary;
use crate::error::AppError;
use crate::models::{Checkpoint, StreamKey};
use crate::progress::{HarvestEvent, ProgressReporter};
use crate::traits::{CheckpointStore, StreamLauncher};

// =============================================================================
// Stream Health
// =============================================================================

/// Liveness of a stream derived from its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    /// Checkpoint updated within the staleness threshold.
    Running { age: Duration },
    /// Checkpoint older than the staleness threshold.
    Stale { age: Duration },
    /// No checkpoint exists yet.
    NotStarted,
}

impl StreamHealth {
    pub fn is_stale(&self) -> bool {
        matches!(self, StreamHealth::Stale { .. })
    }

    pub fn age(&self) -> Option<Duration> {
        match self {
            StreamHealth::Running { age } | StreamHealth::Stale { age } => Some(*age),
            StreamHealth::NotStarted => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StreamHealth::Running { .. } => "running",
            StreamHealth::Stale { .. } => "stale",
            StreamHealth::NotStarted => "not started",
        }
    }
}

/// Classifies a stream. Checkpoints from the future count as fresh.
pub fn stream_health(
    checkpoint: Option<&Checkpoint>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> StreamHealth {
    let Some(checkpoint) = checkpoint else {
        return StreamHealth::NotStarted;
    };
    let age = (now - checkpoint.last_updated_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if age > threshold {
        StreamHealth::Stale { age }
    } else {
        StreamHealth::Running { age }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// What a start or restart request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// A new controller was launched.
    Started,
    /// A live controller exists; nothing was done.
    AlreadyRunning,
    /// The previous controller was cancelled and a new one launched.
    Restarted,
    /// The controller was started too recently to be restarted.
    RecentlyStarted,
}

struct RunningStream {
    handle: JoinHandle<Result<ControllerSummary, AppError>>,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Owns the controller task of every stream.
pub struct Supervisor<L: StreamLauncher> {
    launcher: L,
    cancel: CancellationToken,
    streams: Mutex<HashMap<StreamKey, RunningStream>>,
    shutdown_grace: Duration,
}

impl<L: StreamLauncher> Supervisor<L> {
    /// Controllers get child tokens of `cancel`.
    pub fn new(launcher: L, cancel: CancellationToken) -> Self {
        Self {
            launcher,
            cancel,
            streams: Mutex::new(HashMap::new()),
            shutdown_grace: WatchdogConfig::default().shutdown_grace,
        }
    }

    /// Time a replaced controller gets to flush and save before it is aborted.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamKey, RunningStream>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launches the stream unless a live controller exists.
    pub fn ensure_started(&self, key: &StreamKey) -> Result<RestartOutcome, AppError> {
        let mut streams = self.lock();
        if streams
            .get(key)
            .is_some_and(|running| !running.handle.is_finished())
        {
            return Ok(RestartOutcome::AlreadyRunning);
        }
        let running = self.launch(key)?;
        streams.insert(key.clone(), running);
        Ok(RestartOutcome::Started)
    }

    /// Replaces the stream's controller unless it was started less than
    /// `min_uptime` ago and is still alive.
    ///
    /// The old controller is cancelled and awaited for up to the shutdown
    /// grace period, so its staged entities are flushed and its checkpoint
    /// saved before the replacement starts. It is aborted only on timeout.
    pub async fn restart(
        &self,
        key: &StreamKey,
        min_uptime: Duration,
    ) -> Result<RestartOutcome, AppError> {
        let (outcome, old) = {
            let mut streams = self.lock();
            let outcome = match streams.get(key) {
                Some(running)
                    if !running.handle.is_finished()
                        && running.started_at.elapsed() < min_uptime =>
                {
                    return Ok(RestartOutcome::RecentlyStarted);
                }
                Some(_) => RestartOutcome::Restarted,
                None => RestartOutcome::Started,
            };
            (outcome, streams.remove(key))
        };

        if let Some(old) = old {
            self.stop(key, old).await;
        }

        let running = self.launch(key)?;
        self.lock().insert(key.clone(), running);
        Ok(outcome)
    }

    async fn stop(&self, key: &StreamKey, mut old: RunningStream) {
        old.cancel.cancel();
        match tokio::time::timeout(self.shutdown_grace, &mut old.handle).await {
            Ok(Ok(Ok(summary))) => {
                debug!(
                    stream = %key,
                    written = summary.entities_written,
                    "Replaced controller stopped"
                );
            }
            Ok(Ok(Err(e))) => {
                warn!(stream = %key, error = %e, "Replaced controller ended with error");
            }
            Ok(Err(e)) => {
                warn!(stream = %key, error = %e, "Replaced controller task failed");
            }
            Err(_) => {
                warn!(
                    stream = %key,
                    grace_secs = self.shutdown_grace.as_secs(),
                    "Replaced controller did not stop in time, aborting"
                );
                old.handle.abort();
            }
        }
    }

    fn launch(&self, key: &StreamKey) -> Result<RunningStream, AppError> {
        let cancel = self.cancel.child_token();
        let handle = self.launcher.launch(key, cancel.clone())?;
        debug!(stream = %key, "Controller launched");
        Ok(RunningStream {
            handle,
            cancel,
            started_at: Instant::now(),
        })
    }

    pub fn is_running(&self, key: &StreamKey) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Keys of streams with a live controller.
    pub fn running(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self
            .lock()
            .iter()
            .filter(|(_, running)| !running.handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Cancels every controller and waits for them to finish their final flush.
    pub async fn shutdown(&self) -> Vec<(StreamKey, Result<ControllerSummary, AppError>)> {
        let streams: Vec<(StreamKey, RunningStream)> = self.lock().drain().collect();
        for (_, running) in &streams {
            running.cancel.cancel();
        }

        let mut results = Vec::with_capacity(streams.len());
        for (key, running) in streams {
            let result = match running.handle.await {
                Ok(result) => result,
                Err(e) => Err(AppError::Generic(format!("controller task failed: {}", e))),
            };
            if let Err(e) = &result {
                error!(stream = %key, error = %e, "Controller ended with error");
            }
            results.push((key, result));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

// =============================================================================
// Watchdog
// =============================================================================

/// Result of inspecting one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub key: StreamKey,
    pub health: StreamHealth,
    pub action: Option<RestartOutcome>,
}

/// Restarts streams whose checkpoints went stale.
pub struct Watchdog<K: CheckpointStore, L: StreamLauncher> {
    checkpoints: K,
    supervisor: Arc<Supervisor<L>>,
    config: WatchdogConfig,
    /// Watched streams and their staleness thresholds.
    watched: BTreeMap<StreamKey, Duration>,
}

impl<K: CheckpointStore, L: StreamLauncher> Watchdog<K, L> {
    pub fn new(checkpoints: K, supervisor: Arc<Supervisor<L>>, config: WatchdogConfig) -> Self {
        Self {
            checkpoints,
            supervisor,
            config,
            watched: BTreeMap::new(),
        }
    }

    /// Watches a stream with the default staleness threshold.
    pub fn watch(mut self, key: StreamKey) -> Self {
        let threshold = self.config.staleness_threshold;
        self.watched.insert(key, threshold);
        self
    }

    /// Watches a stream with its own staleness threshold.
    pub fn watch_with_threshold(mut self, key: StreamKey, threshold: Duration) -> Self {
        self.watched.insert(key, threshold);
        self
    }

    pub fn watched(&self) -> impl Iterator<Item = &StreamKey> {
        self.watched.keys()
    }

    /// Inspects every watched stream once, starting or restarting as needed.
    pub async fn poll_once<R: ProgressReporter>(
        &self,
        now: DateTime<Utc>,
        reporter: &R,
    ) -> Result<Vec<StreamReport>, AppError> {
        let checkpoints: HashMap<StreamKey, Checkpoint> = self
            .checkpoints
            .list()
            .await?
            .into_iter()
            .map(|checkpoint| (checkpoint.key(), checkpoint))
            .collect();

        let mut reports = Vec::with_capacity(self.watched.len());
        for (key, threshold) in &self.watched {
            let health = stream_health(checkpoints.get(key), now, *threshold);
            let action = match health {
                StreamHealth::Running { .. } => None,
                StreamHealth::NotStarted => Some(self.supervisor.ensure_started(key)),
                StreamHealth::Stale { age } => {
                    reporter.report(HarvestEvent::StreamStale { stream: key, age });
                    Some(self.supervisor.restart(key, *threshold).await)
                }
            };

            let action = match action {
                Some(Ok(outcome)) => {
                    if matches!(outcome, RestartOutcome::Restarted | RestartOutcome::Started)
                        && health.is_stale()
                    {
                        reporter.report(HarvestEvent::StreamRestarted { stream: key });
                    }
                    Some(outcome)
                }
                Some(Err(e)) => {
                    warn!(stream = %key, error = %e, "Failed to launch controller");
                    None
                }
                None => None,
            };

            reports.push(StreamReport {
                key: key.clone(),
                health,
                action,
            });
        }
        Ok(reports)
    }

    /// Polls every `poll_interval` until cancelled.
    pub async fn run<R: ProgressReporter>(&self, cancel: CancellationToken, reporter: &R) {
        info!(
            streams = self.watched.len(),
            poll_secs = self.config.poll_interval.as_secs(),
            "Watchdog started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.poll_once(Utc::now(), reporter).await {
                error!(error = %e, "Watchdog poll failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("Watchdog stopped");
    }
}

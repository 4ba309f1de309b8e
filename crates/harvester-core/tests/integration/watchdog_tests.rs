//! Integration tests for the supervisor and the watchdog driving real
//! controllers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harvester_core::traits::{CheckpointStore, StreamLauncher};
use harvester_core::{
    AppError, Checkpoint, ControllerConfig, ControllerSummary, MemoryCheckpointStore,
    PositionRange, RestartOutcome, SilentReporter, StreamHealth, StreamKey, Supervisor, Watchdog,
    WatchdogConfig,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{MockEntityStore, MockParser, MockSourceClient, fetch_pool};

/// Launches a controller over positions 1..=100 for any stream.
#[derive(Clone)]
struct ControllerLauncher {
    client: MockSourceClient,
    store: MockEntityStore,
    checkpoints: MemoryCheckpointStore,
}

impl StreamLauncher for ControllerLauncher {
    fn launch(
        &self,
        key: &StreamKey,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<ControllerSummary, AppError>>, AppError> {
        let controller = harvester_core::CycleController::new(
            key.clone(),
            fetch_pool(self.client.clone(), 5),
            MockParser,
            self.store.clone(),
            self.checkpoints.clone(),
            ControllerConfig::new(PositionRange::bounded(1, 100))
                .with_block_size(25)
                .with_worker_id(format!("worker-{}", key.stream)),
        );
        Ok(tokio::spawn(async move {
            controller.run(cancel, &SilentReporter).await
        }))
    }
}

fn launcher() -> ControllerLauncher {
    ControllerLauncher {
        client: MockSourceClient::new().with_delay(Duration::from_millis(10)),
        store: MockEntityStore::new(),
        checkpoints: MemoryCheckpointStore::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_starts_and_restarts_streams() {
    let launcher = launcher();
    let stale = StreamKey::new("shop", "products");
    let missing = StreamKey::new("shop", "sellers");

    // A checkpoint last touched three hours ago.
    let mut old = Checkpoint::new(&stale, 1, Utc::now() - chrono::Duration::hours(3));
    old.position = 40;
    launcher.checkpoints.save(&old).await.unwrap();

    let root = CancellationToken::new();
    let supervisor = Arc::new(Supervisor::new(launcher.clone(), root.clone()));
    let watchdog = Watchdog::new(
        launcher.checkpoints.clone(),
        supervisor.clone(),
        WatchdogConfig::default(),
    )
    .watch(stale.clone())
    .watch(missing.clone());

    let reports = watchdog.poll_once(Utc::now(), &SilentReporter).await.unwrap();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        match report.health {
            StreamHealth::Stale { .. } => assert_eq!(report.key, stale),
            StreamHealth::NotStarted => assert_eq!(report.key, missing),
            StreamHealth::Running { .. } => panic!("no stream was running"),
        }
        assert_eq!(report.action, Some(RestartOutcome::Started));
    }
    assert_eq!(supervisor.running(), vec![stale.clone(), missing.clone()]);

    // The restarted controller resumes and refreshes its checkpoint.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let reports = watchdog.poll_once(Utc::now(), &SilentReporter).await.unwrap();
    assert!(
        reports
            .iter()
            .all(|r| matches!(r.health, StreamHealth::Running { .. }))
    );

    root.cancel();
    let results = supervisor.shutdown().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, result)| result.is_ok()));

    let resumed = launcher.checkpoints.load(&stale).await.unwrap().unwrap();
    assert!(resumed.position > 40 || resumed.cycle_count > 0);
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_shutdown_saves_every_stream() {
    let launcher = launcher();
    let supervisor = Supervisor::new(launcher.clone(), CancellationToken::new());
    let keys = [
        StreamKey::new("shop", "products"),
        StreamKey::new("shop", "sellers"),
    ];
    for key in &keys {
        assert_eq!(supervisor.ensure_started(key).unwrap(), RestartOutcome::Started);
    }

    tokio::time::sleep(Duration::from_millis(30)).await;
    let results = supervisor.shutdown().await;

    assert_eq!(results.len(), 2);
    for (key, result) in results {
        let summary = result.unwrap();
        let saved = launcher.checkpoints.load(&key).await.unwrap().unwrap();
        assert_eq!(Some(saved), summary.checkpoint);
    }
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_run_stops_on_cancel() {
    let launcher = launcher();
    let supervisor = Arc::new(Supervisor::new(launcher.clone(), CancellationToken::new()));
    let watchdog = Watchdog::new(
        launcher.checkpoints.clone(),
        supervisor.clone(),
        WatchdogConfig::default().with_poll_interval(Duration::from_secs(300)),
    )
    .watch(StreamKey::new("shop", "products"));

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { watchdog.run(cancel, &SilentReporter).await })
    };

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(supervisor.running().len(), 1);

    cancel.cancel();
    run.await.unwrap();
    supervisor.shutdown().await;
}

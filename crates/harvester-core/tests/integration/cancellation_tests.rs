//! Integration tests for graceful shutdown and resume.

use std::time::Duration;

use harvester_core::traits::CheckpointStore;
use harvester_core::{ControllerConfig, MemoryCheckpointStore, PositionRange, SilentReporter};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{
    CrashPoint, CrashingCheckpointStore, MockEntityStore, MockSourceClient, RecordingReporter,
    controller, stream_key,
};

fn config() -> ControllerConfig {
    ControllerConfig::new(PositionRange::bounded(1, 200))
        .with_block_size(20)
        .with_batch_flush_size(1000)
        .with_worker_id("worker-a")
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_before_start() {
    let client = MockSourceClient::new();
    let checkpoints = MemoryCheckpointStore::new();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = controller(client.clone(), MockEntityStore::new(), checkpoints.clone(), config())
        .run(cancel, &SilentReporter)
        .await
        .unwrap();

    assert_eq!(summary.positions_fetched, 0);
    assert_eq!(client.total_calls(), 0);

    // The checkpoint is created at the range start even if nothing ran.
    let checkpoint = checkpoints.load(&stream_key()).await.unwrap().unwrap();
    assert_eq!(checkpoint.position, 1);
    assert_eq!(checkpoint.cycle_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_flushes_and_resume_completes_cycle() {
    let client = MockSourceClient::new().with_delay(Duration::from_millis(100));
    let store = MockEntityStore::new();
    let checkpoints = MemoryCheckpointStore::new();
    let reporter = RecordingReporter::default();

    // First run: cancelled part-way through the range.
    let cancel = CancellationToken::new();
    let handle = {
        let controller = controller(client.clone(), store.clone(), checkpoints.clone(), config());
        let cancel = cancel.clone();
        let reporter = reporter.clone();
        tokio::spawn(async move { controller.run(cancel, &reporter).await })
    };
    tokio::time::sleep(Duration::from_millis(750)).await;
    cancel.cancel();
    let first = handle.await.unwrap().unwrap();

    assert_eq!(reporter.count("shutdown"), 1);
    assert!(first.positions_fetched > 0);
    assert!(first.positions_fetched < 200);

    // Staged work was flushed on shutdown and every marked position is durable.
    assert_eq!(store.len() as u64, first.entities_written);
    for position in 1..=200 {
        if checkpoints.is_processed(&stream_key(), position) {
            assert!(store.contains("product", &position.to_string()));
        }
    }
    let saved = checkpoints.load(&stream_key()).await.unwrap().unwrap();
    assert_eq!(saved.cycle_count, 0);
    assert_eq!(saved.total_processed as u64, first.entities_written);

    // Second run resumes and finishes the cycle.
    let second = controller(
        client.clone(),
        store.clone(),
        checkpoints.clone(),
        config().with_max_cycles(Some(1)),
    )
    .run(CancellationToken::new(), &SilentReporter)
    .await
    .unwrap();

    assert_eq!(second.cycles_completed, 1);
    assert_eq!(store.len(), 200);
    // Already processed positions were not fetched again.
    assert!(first.positions_fetched + second.positions_fetched <= 200 + 20);
    for position in 1..=200 {
        assert!(client.calls_for(position) >= 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_with_unavailable_store_never_advances_checkpoint() {
    let client = MockSourceClient::new().with_delay(Duration::from_millis(50));
    let store = MockEntityStore::unavailable();
    let checkpoints = MemoryCheckpointStore::new();

    let cancel = CancellationToken::new();
    let handle = {
        let controller = controller(
            client,
            store.clone(),
            checkpoints.clone(),
            config().with_flush_retry(Duration::from_secs(1), 3),
        );
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel, &SilentReporter).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();

    // The flush gives up after its attempts once shutdown was requested.
    assert!(handle.await.unwrap().is_err());
    assert_eq!(store.len(), 0);

    // Blocks still refreshed the checkpoint, but none of it became durable.
    let history = checkpoints.history();
    assert!(history.len() > 1);
    for checkpoint in &history {
        assert_eq!(checkpoint.position, 1);
        assert_eq!(checkpoint.total_processed, 0);
    }
    assert_eq!(checkpoints.processed_count(&stream_key()).await.unwrap(), 0);
}

/// Runs 1..=100 in blocks of 10 with flushes of 25 until the checkpoint store
/// hangs at `at` after the first flush, then aborts the run.
async fn crash_after_first_flush(
    client: &MockSourceClient,
    store: &MockEntityStore,
    checkpoints: &MemoryCheckpointStore,
    at: CrashPoint,
) {
    let crashing = CrashingCheckpointStore::new(checkpoints.clone(), store.clone(), at, 25);
    let config = ControllerConfig::new(PositionRange::bounded(1, 100))
        .with_block_size(10)
        .with_batch_flush_size(25)
        .with_worker_id("worker-a");
    let handle = {
        let controller = controller(client.clone(), store.clone(), crashing, config);
        tokio::spawn(async move { controller.run(CancellationToken::new(), &SilentReporter).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!handle.is_finished());
    handle.abort();
    let _ = handle.await;
}

fn resume_config() -> ControllerConfig {
    ControllerConfig::new(PositionRange::bounded(1, 100))
        .with_block_size(10)
        .with_batch_flush_size(25)
        .with_max_cycles(Some(1))
        .with_worker_id("worker-a")
}

#[tokio::test(start_paused = true)]
async fn test_crash_before_marking_replays_flushed_positions() {
    let client = MockSourceClient::new();
    let store = MockEntityStore::new();
    let checkpoints = MemoryCheckpointStore::new();

    crash_after_first_flush(&client, &store, &checkpoints, CrashPoint::MarkProcessed).await;

    // Written but neither marked nor checkpointed.
    assert_eq!(store.len(), 25);
    assert_eq!(checkpoints.processed_count(&stream_key()).await.unwrap(), 0);
    let saved = checkpoints.load(&stream_key()).await.unwrap().unwrap();
    assert_eq!(saved.position, 1);
    assert_eq!(saved.total_processed, 0);

    let summary = controller(client.clone(), store.clone(), checkpoints.clone(), resume_config())
        .run(CancellationToken::new(), &SilentReporter)
        .await
        .unwrap();
    assert_eq!(summary.cycles_completed, 1);

    // The flushed positions are written again and the upsert absorbs them.
    assert_eq!(store.len(), 100);
    for position in 1..=100 {
        assert!(store.contains("product", &position.to_string()));
    }
    for position in 1..=30 {
        assert_eq!(client.calls_for(position), 2, "position {position}");
    }
    for position in 31..=100 {
        assert_eq!(client.calls_for(position), 1, "position {position}");
    }
    assert_eq!(store.batch_sizes.lock().unwrap().iter().sum::<usize>(), 125);
}

#[tokio::test(start_paused = true)]
async fn test_crash_before_save_keeps_marked_positions() {
    let client = MockSourceClient::new();
    let store = MockEntityStore::new();
    let checkpoints = MemoryCheckpointStore::new();

    crash_after_first_flush(&client, &store, &checkpoints, CrashPoint::Save).await;

    // Marked after the flush; the save itself never happened.
    assert_eq!(store.len(), 25);
    assert_eq!(checkpoints.processed_count(&stream_key()).await.unwrap(), 25);
    let saved = checkpoints.load(&stream_key()).await.unwrap().unwrap();
    assert_eq!(saved.total_processed, 0);

    controller(client.clone(), store.clone(), checkpoints.clone(), resume_config())
        .run(CancellationToken::new(), &SilentReporter)
        .await
        .unwrap();

    // Nothing lost and nothing written twice.
    assert_eq!(store.len(), 100);
    for position in 1..=25 {
        assert_eq!(client.calls_for(position), 1, "position {position}");
    }
    // Staged but never flushed before the crash.
    for position in 26..=30 {
        assert_eq!(client.calls_for(position), 2, "position {position}");
    }
    assert_eq!(store.batch_sizes.lock().unwrap().iter().sum::<usize>(), 100);
}

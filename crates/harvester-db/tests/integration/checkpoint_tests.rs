//! Integration tests for PgCheckpointStore.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use harvester_core::traits::CheckpointStore;
use harvester_core::{Checkpoint, StreamKey};
use harvester_db::PgCheckpointStore;

use crate::integration::common::setup_test_db;

fn key() -> StreamKey {
    StreamKey::new("shop", "products")
}

#[tokio::test]
async fn test_save_overwrites_and_load_round_trips() {
    let (pool, _container) = setup_test_db().await;
    let store = PgCheckpointStore::new(pool);

    assert!(store.load(&key()).await.unwrap().is_none());

    let mut checkpoint = Checkpoint::new(&key(), 1, Utc::now());
    store.save(&checkpoint).await.unwrap();
    checkpoint.advance(500, 480, 12.5, Utc::now());
    checkpoint.worker_id = Some("worker-a".to_string());
    store.save(&checkpoint).await.unwrap();

    let loaded = store.load(&key()).await.unwrap().unwrap();
    assert_eq!(loaded.position, 500);
    assert_eq!(loaded.total_processed, 480);
    assert_eq!(loaded.observed_rate, 12.5);
    assert_eq!(loaded.worker_id.as_deref(), Some("worker-a"));
}

#[tokio::test]
async fn test_list_is_ordered_by_key() {
    let (pool, _container) = setup_test_db().await;
    let store = PgCheckpointStore::new(pool);

    for (source, stream) in [("shop", "skus"), ("forum", "threads"), ("shop", "products")] {
        store
            .save(&Checkpoint::new(&StreamKey::new(source, stream), 1, Utc::now()))
            .await
            .unwrap();
    }

    let keys: Vec<String> = store
        .list()
        .await
        .unwrap()
        .iter()
        .map(|cp| cp.key().to_string())
        .collect();
    assert_eq!(keys, vec!["forum/threads", "shop/products", "shop/skus"]);
}

#[tokio::test]
async fn test_seen_set_lifecycle() {
    let (pool, _container) = setup_test_db().await;
    let store = PgCheckpointStore::new(pool);

    let claimed = store
        .filter_unprocessed(&key(), &[1, 2, 3, 4], "worker-a")
        .await
        .unwrap();
    assert_eq!(claimed, vec![1, 2, 3, 4]);

    assert_eq!(store.mark_processed(&key(), &[1, 2, 2]).await.unwrap(), 2);
    assert_eq!(store.mark_processed(&key(), &[2]).await.unwrap(), 0);
    assert_eq!(store.processed_count(&key()).await.unwrap(), 2);

    // Processed ids are gone; the owner can re-claim its own pending ids.
    let claimed = store
        .filter_unprocessed(&key(), &[1, 2, 3, 4, 5], "worker-a")
        .await
        .unwrap();
    assert_eq!(claimed, vec![3, 4, 5]);

    // Another owner cannot take live claims.
    let claimed = store
        .filter_unprocessed(&key(), &[3, 4, 5, 6], "worker-b")
        .await
        .unwrap();
    assert_eq!(claimed, vec![6]);

    assert!(store.clear_processed(&key()).await.unwrap() >= 2);
    assert_eq!(store.processed_count(&key()).await.unwrap(), 0);
    let claimed = store
        .filter_unprocessed(&key(), &[1, 2], "worker-b")
        .await
        .unwrap();
    assert_eq!(claimed, vec![1, 2]);
}

#[tokio::test]
async fn test_expired_claims_can_be_taken_over() {
    let (pool, _container) = setup_test_db().await;
    let store = PgCheckpointStore::new(pool).with_claim_ttl(Duration::ZERO);

    store
        .filter_unprocessed(&key(), &[1, 2], "worker-a")
        .await
        .unwrap();
    let claimed = store
        .filter_unprocessed(&key(), &[1, 2], "worker-b")
        .await
        .unwrap();
    assert_eq!(claimed, vec![1, 2]);
}

#[tokio::test]
async fn test_concurrent_filters_partition_ids() {
    let (pool, _container) = setup_test_db().await;
    let store = PgCheckpointStore::new(pool);
    let ids: Vec<i64> = (1..=500).collect();

    let results = join_all((0..8).map(|worker| {
        let store = store.clone();
        let ids = ids.clone();
        async move {
            store
                .filter_unprocessed(&key(), &ids, &format!("worker-{worker}"))
                .await
                .unwrap()
        }
    }))
    .await;

    let total: usize = results.iter().map(Vec::len).sum();
    let union: HashSet<i64> = results.into_iter().flatten().collect();
    assert_eq!(total, 500, "every id claimed exactly once");
    assert_eq!(union.len(), 500);
}

#[tokio::test]
async fn test_delete_removes_checkpoint_and_seen_set() {
    let (pool, _container) = setup_test_db().await;
    let store = PgCheckpointStore::new(pool);

    store
        .save(&Checkpoint::new(&key(), 1, Utc::now()))
        .await
        .unwrap();
    store.mark_processed(&key(), &[1, 2, 3]).await.unwrap();

    assert!(store.delete(&key()).await.unwrap());
    assert!(!store.delete(&key()).await.unwrap());
    assert!(store.load(&key()).await.unwrap().is_none());
    assert_eq!(store.processed_count(&key()).await.unwrap(), 0);
}

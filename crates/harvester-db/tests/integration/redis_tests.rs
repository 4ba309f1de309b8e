//! Integration tests for RedisCheckpointStore.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use fred::prelude::*;
use futures::future::join_all;
use harvester_core::traits::CheckpointStore;
use harvester_core::{AppError, Checkpoint, StreamKey};

use crate::integration::common::setup_test_redis;

fn key() -> StreamKey {
    StreamKey::new("shop", "products")
}

#[tokio::test]
async fn test_save_load_list_delete() {
    let (store, _container) = setup_test_redis().await;

    assert!(store.load(&key()).await.unwrap().is_none());

    let mut checkpoint = Checkpoint::new(&key(), 1, Utc::now());
    checkpoint.advance(250, 240, 3.0, Utc::now());
    store.save(&checkpoint).await.unwrap();
    store
        .save(&Checkpoint::new(&StreamKey::new("forum", "threads"), 1, Utc::now()))
        .await
        .unwrap();

    assert_eq!(store.load(&key()).await.unwrap(), Some(checkpoint));
    let keys: Vec<String> = store
        .list()
        .await
        .unwrap()
        .iter()
        .map(|cp| cp.key().to_string())
        .collect();
    assert_eq!(keys, vec!["forum/threads", "shop/products"]);

    assert!(store.delete(&key()).await.unwrap());
    assert!(!store.delete(&key()).await.unwrap());
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_seen_set_and_claims() {
    let (store, _container) = setup_test_redis().await;

    let claimed = store
        .filter_unprocessed(&key(), &[1, 2, 3], "worker-a")
        .await
        .unwrap();
    assert_eq!(claimed, vec![1, 2, 3]);

    assert_eq!(store.mark_processed(&key(), &[1]).await.unwrap(), 1);
    assert_eq!(store.processed_count(&key()).await.unwrap(), 1);

    let claimed = store
        .filter_unprocessed(&key(), &[1, 2, 3, 4], "worker-b")
        .await
        .unwrap();
    assert_eq!(claimed, vec![4]);

    assert_eq!(store.clear_processed(&key()).await.unwrap(), 1);
    let claimed = store
        .filter_unprocessed(&key(), &[1, 2], "worker-b")
        .await
        .unwrap();
    assert_eq!(claimed, vec![1, 2]);
}

#[tokio::test]
async fn test_expired_claims_can_be_taken_over() {
    let (store, _container) = setup_test_redis().await;
    let store = store.with_claim_ttl(Duration::ZERO);

    store
        .filter_unprocessed(&key(), &[7], "worker-a")
        .await
        .unwrap();
    let claimed = store
        .filter_unprocessed(&key(), &[7], "worker-b")
        .await
        .unwrap();
    assert_eq!(claimed, vec![7]);
}

#[tokio::test]
async fn test_concurrent_filters_partition_ids() {
    let (store, _container) = setup_test_redis().await;
    let ids: Vec<i64> = (1..=300).collect();

    let results = join_all((0..6).map(|worker| {
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
    assert_eq!(total, 300);
    assert_eq!(union.len(), 300);
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let (store, _container) = setup_test_redis().await;
    let other = store.clone().with_namespace("other");

    other
        .save(&Checkpoint::new(&key(), 1, Utc::now()))
        .await
        .unwrap();

    assert!(store.load(&key()).await.unwrap().is_none());
    assert!(store.list().await.unwrap().is_empty());
    assert_eq!(other.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_reported() {
    let (store, container) = setup_test_redis().await;
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(6379).await.unwrap();

    let config = Config::from_url(&format!("redis://{}:{}/0", host, port)).unwrap();
    let client = Builder::from_config(config).build().unwrap();
    client.init().await.unwrap();
    let _: () = client
        .set("harvester:checkpoint:shop:products", "not json", None, None, false)
        .await
        .unwrap();

    assert!(matches!(
        store.load(&key()).await,
        Err(AppError::CorruptCheckpoint(_))
    ));
}

//! Integration tests for EntityRepository.

use harvester_core::traits::EntityStore;
use harvester_core::{Entity, StagedBatch, StagingBuffer, UpdateMode};
use harvester_db::EntityRepository;
use serde_json::json;

use crate::integration::common::setup_test_db;

fn batch(entities: Vec<Entity>) -> StagedBatch {
    let mut buffer = StagingBuffer::new(entities.len().max(1), vec![]);
    for entity in entities {
        buffer.stage(entity);
    }
    buffer.drain()
}

fn product(id: &str, title: serde_json::Value, price: serde_json::Value) -> Entity {
    Entity::new("product", id)
        .with_field("title", title)
        .with_field("price", price)
        .with_reference("seller", "9")
}

#[tokio::test]
async fn test_write_batch_inserts_parents_and_children() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);

    let counts = repo
        .write_batch(
            "shop",
            &batch(vec![
                product("1", json!("lamp"), json!(10)),
                product("2", json!("desk"), json!(80)),
                Entity::new("seller", "9").with_field("name", json!("acme")),
            ]),
            UpdateMode::Additive,
        )
        .await
        .expect("write should succeed");

    assert_eq!(counts.per_kind[0], ("seller".to_string(), 1));
    assert_eq!(counts.for_kind("product"), 2);
    assert_eq!(repo.count("shop", "product").await.unwrap(), 2);
    assert_eq!(
        repo.get_fields("shop", "seller", "9").await.unwrap(),
        Some(json!({ "name": "acme" }))
    );
}

#[tokio::test]
async fn test_additive_update_keeps_known_fields() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);

    repo.write_batch(
        "shop",
        &batch(vec![product("1", json!("lamp"), json!(10))]),
        UpdateMode::Additive,
    )
    .await
    .unwrap();
    repo.write_batch(
        "shop",
        &batch(vec![product("1", serde_json::Value::Null, json!(12))]),
        UpdateMode::Additive,
    )
    .await
    .unwrap();

    let fields = repo.get_fields("shop", "product", "1").await.unwrap().unwrap();
    assert_eq!(fields, json!({ "title": "lamp", "price": 12 }));
}

#[tokio::test]
async fn test_replace_mode_overwrites_fields() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);

    repo.write_batch(
        "shop",
        &batch(vec![product("1", json!("lamp"), json!(10))]),
        UpdateMode::Replace,
    )
    .await
    .unwrap();
    repo.write_batch(
        "shop",
        &batch(vec![Entity::new("product", "1").with_field("price", json!(12))]),
        UpdateMode::Replace,
    )
    .await
    .unwrap();

    let fields = repo.get_fields("shop", "product", "1").await.unwrap().unwrap();
    assert_eq!(fields, json!({ "price": 12 }));
}

#[tokio::test]
async fn test_same_snapshot_twice_is_idempotent() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool).with_chunk_size(2);
    let snapshot = batch(
        (1..=5)
            .map(|i| product(&i.to_string(), json!(format!("item {i}")), json!(i)))
            .collect(),
    );

    repo.write_batch("shop", &snapshot, UpdateMode::Additive)
        .await
        .unwrap();
    let first = repo.get_fields("shop", "product", "3").await.unwrap();
    repo.write_batch("shop", &snapshot, UpdateMode::Additive)
        .await
        .unwrap();

    assert_eq!(repo.count("shop", "product").await.unwrap(), 5);
    assert_eq!(repo.get_fields("shop", "product", "3").await.unwrap(), first);
}

#[tokio::test]
async fn test_failed_kind_rolls_back_whole_batch() {
    let (pool, _container) = setup_test_db().await;
    sqlx::query("ALTER TABLE harvest_entities ADD CONSTRAINT no_bad_ids CHECK (entity_id <> 'bad')")
        .execute(&pool)
        .await
        .unwrap();
    let repo = EntityRepository::new(pool).with_chunk_size(1);

    let result = repo
        .write_batch(
            "shop",
            &batch(vec![
                Entity::new("seller", "9"),
                product("1", json!("lamp"), json!(10)),
                product("bad", json!("broken"), json!(0)),
            ]),
            UpdateMode::Additive,
        )
        .await;

    assert!(result.is_err());
    assert_eq!(repo.count("shop", "seller").await.unwrap(), 0);
    assert_eq!(repo.count("shop", "product").await.unwrap(), 0);
}

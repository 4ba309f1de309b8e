//! Redis-compatible checkpoint store.
//!
//! Every mutation runs as one Lua script, so it is a single atomic round trip
//! even with many controllers sharing the instance.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `{ns}:checkpoint:{source}:{stream}` | JSON | Serialized [`Checkpoint`] |
//! | `{ns}:checkpoints` | Set | Keys of all checkpoints |
//! | `{ns}:seen:{source}:{stream}` | Set | Processed positions of the current cycle |
//! | `{ns}:claims:{source}:{stream}` | Hash | position → `expires_ms\|owner` |

use std::time::Duration;

use chrono::Utc;
use fred::prelude::*;
use harvester_core::checkpoint::DEFAULT_CLAIM_TTL;
use harvester_core::error::AppError;
use harvester_core::models::{Checkpoint, Position, StreamKey};
use harvester_core::traits::CheckpointStore;

/// KEYS: seen, claims. ARGV: owner, now_ms, ttl_ms, ids...
const FILTER_UNPROCESSED_SCRIPT: &str = r#"
local owner = ARGV[1]
local now = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local claimed = {}
for i = 4, #ARGV do
  local id = ARGV[i]
  if redis.call('SISMEMBER', KEYS[1], id) == 0 then
    local claim = redis.call('HGET', KEYS[2], id)
    local free = true
    if claim then
      local sep = string.find(claim, '|', 1, true)
      local expires = tonumber(string.sub(claim, 1, sep - 1))
      local holder = string.sub(claim, sep + 1)
      free = holder == owner or expires <= now
    end
    if free then
      redis.call('HSET', KEYS[2], id, (now + ttl) .. '|' .. owner)
      table.insert(claimed, tonumber(id))
    end
  end
end
return claimed
"#;

/// KEYS: seen, claims. ARGV: ids...
const MARK_PROCESSED_SCRIPT: &str = r#"
local added = 0
for i = 1, #ARGV do
  added = added + redis.call('SADD', KEYS[1], ARGV[i])
  redis.call('HDEL', KEYS[2], ARGV[i])
end
return added
"#;

/// KEYS: seen, claims.
const CLEAR_PROCESSED_SCRIPT: &str = r#"
local count = redis.call('SCARD', KEYS[1])
redis.call('DEL', KEYS[1], KEYS[2])
return count
"#;

/// KEYS: checkpoint, index. ARGV: json.
const SAVE_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], KEYS[1])
return 1
"#;

/// KEYS: checkpoint, index, seen, claims.
const DELETE_SCRIPT: &str = r#"
local existed = redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], KEYS[1])
redis.call('DEL', KEYS[3], KEYS[4])
return existed
"#;

fn store_error(e: fred::error::Error) -> AppError {
    AppError::StoreUnavailable(format!("redis: {}", e))
}

/// Redis implementation of [`CheckpointStore`].
#[derive(Clone)]
pub struct RedisCheckpointStore {
    client: Client,
    namespace: String,
    claim_ttl: Duration,
}

impl RedisCheckpointStore {
    /// Connects to a Redis-compatible server, e.g. `redis://localhost:6379/0`.
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let config = Config::from_url(url)
            .map_err(|e| AppError::ConfigError(format!("Invalid Redis URL: {}", e)))?;

        let client = Builder::from_config(config).build().map_err(store_error)?;
        client.init().await.map_err(store_error)?;

        tracing::info!("Connected to Redis checkpoint store");
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: "harvester".to_string(),
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }

    /// Prefix of every key written by this store.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    fn checkpoint_key(&self, key: &StreamKey) -> String {
        format!("{}:checkpoint:{}:{}", self.namespace, key.source, key.stream)
    }

    fn index_key(&self) -> String {
        format!("{}:checkpoints", self.namespace)
    }

    fn seen_key(&self, key: &StreamKey) -> String {
        format!("{}:seen:{}:{}", self.namespace, key.source, key.stream)
    }

    fn claims_key(&self, key: &StreamKey) -> String {
        format!("{}:claims:{}:{}", self.namespace, key.source, key.stream)
    }

    async fn get_checkpoint(&self, redis_key: &str) -> Result<Option<Checkpoint>, AppError> {
        let value: Option<String> = self.client.get(redis_key).await.map_err(store_error)?;
        value
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| {
                    AppError::CorruptCheckpoint(format!("{}: {}", redis_key, e))
                })
            })
            .transpose()
    }
}

impl CheckpointStore for RedisCheckpointStore {
    async fn load(&self, key: &StreamKey) -> Result<Option<Checkpoint>, AppError> {
        self.get_checkpoint(&self.checkpoint_key(key)).await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        let json = serde_json::to_string(checkpoint)?;
        let keys = vec![self.checkpoint_key(&checkpoint.key()), self.index_key()];
        let _: i64 = self
            .client
            .eval(SAVE_SCRIPT, keys, vec![json])
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn filter_unprocessed(
        &self,
        key: &StreamKey,
        ids: &[Position],
        owner: &str,
    ) -> Result<Vec<Position>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = Vec::with_capacity(ids.len() + 3);
        args.push(owner.to_string());
        args.push(Utc::now().timestamp_millis().to_string());
        args.push(self.claim_ttl.as_millis().to_string());
        args.extend(ids.iter().map(|id| id.to_string()));

        let mut claimed: Vec<i64> = self
            .client
            .eval(
                FILTER_UNPROCESSED_SCRIPT,
                vec![self.seen_key(key), self.claims_key(key)],
                args,
            )
            .await
            .map_err(store_error)?;
        claimed.sort_unstable();
        claimed.dedup();
        Ok(claimed)
    }

    async fn mark_processed(&self, key: &StreamKey, ids: &[Position]) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let args: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let added: i64 = self
            .client
            .eval(
                MARK_PROCESSED_SCRIPT,
                vec![self.seen_key(key), self.claims_key(key)],
                args,
            )
            .await
            .map_err(store_error)?;
        Ok(added as u64)
    }

    async fn clear_processed(&self, key: &StreamKey) -> Result<u64, AppError> {
        let cleared: i64 = self
            .client
            .eval(
                CLEAR_PROCESSED_SCRIPT,
                vec![self.seen_key(key), self.claims_key(key)],
                Vec::<String>::new(),
            )
            .await
            .map_err(store_error)?;
        Ok(cleared as u64)
    }

    async fn processed_count(&self, key: &StreamKey) -> Result<u64, AppError> {
        self.client
            .scard(self.seen_key(key))
            .await
            .map_err(store_error)
    }

    async fn delete(&self, key: &StreamKey) -> Result<bool, AppError> {
        let existed: i64 = self
            .client
            .eval(
                DELETE_SCRIPT,
                vec![
                    self.checkpoint_key(key),
                    self.index_key(),
                    self.seen_key(key),
                    self.claims_key(key),
                ],
                Vec::<String>::new(),
            )
            .await
            .map_err(store_error)?;
        Ok(existed > 0)
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, AppError> {
        let mut keys: Vec<String> = self
            .client
            .smembers(self.index_key())
            .await
            .map_err(store_error)?;
        keys.sort();

        let mut checkpoints = Vec::with_capacity(keys.len());
        for redis_key in keys {
            // A key may vanish between SMEMBERS and GET after a concurrent reset.
            if let Some(checkpoint) = self.get_checkpoint(&redis_key).await? {
                checkpoints.push(checkpoint);
            }
        }
        checkpoints.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(checkpoints)
    }
}

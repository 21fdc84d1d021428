//! Redis-backed counter store.
//!
//! Shared by the HTTP server and the indexer. Marker and counter updates run
//! as Lua scripts so Redis applies both halves atomically. The removal
//! script touches a counter key it derives from the marker's value, which
//! is not declared up front, so only single-node Redis is supported.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Script};
use serde_json::Value;

use super::{counter_value, CounterStore, Removed, StoreError, StoreResult};
use crate::scope::COUNT_PREFIX;

/// Increments the counter, then sets the marker, unless the marker exists.
/// Returns nil when the marker already existed.
///
/// Redis does not roll back a failed script, so the counter is touched
/// first: an `INCR` error leaves no marker behind.
const RECORD_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 1 then
        return false
    end
    local count = redis.call('INCR', KEYS[2])
    redis.call('SET', KEYS[1], ARGV[1])
    return count
"#;

/// Decrements the counter the marker names, then deletes the marker.
/// Returns nil when the marker is missing, else `{scope_key, new_count}`.
const REMOVE_SCRIPT: &str = r#"
    local scope_key = redis.call('GET', KEYS[1])
    if not scope_key then
        return false
    end
    local count = redis.call('DECR', ARGV[1] .. scope_key)
    redis.call('DEL', KEYS[1])
    return {scope_key, count}
"#;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Redis counter store.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    record_script: Script,
    remove_script: Script,
}

impl RedisCounterStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `timeout` - Limit on each command's response and on connecting
    pub async fn connect(redis_url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Backend(format!("Redis connection error: {}", e)))?;

        let config = ConnectionManagerConfig::new()
            .set_response_timeout(timeout)
            .set_connection_timeout(timeout);
        let conn = ConnectionManager::new_with_config(client, config).await.map_err(|e| {
            StoreError::Backend(format!("Redis connection manager error: {}", e))
        })?;

        Ok(Self {
            conn,
            record_script: Script::new(RECORD_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr::<_, _, i64>(key, 1).await?)
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.decr::<_, _, i64>(key, 1).await?)
    }

    async fn sum(&self, keys: &[String]) -> StoreResult<i64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;

        Ok(values.iter().map(|v| counter_value(v.as_deref())).sum())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn put_json_expiring(&self, key: &str, value: &Value, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let encoded = serde_json::to_string(value)?;
        // EX rejects 0, so round sub-second TTLs up.
        let ttl_secs = ttl.as_secs().max(1);

        redis::cmd("SET")
            .arg(key)
            .arg(encoded)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_json(&self, key: &str) -> StoreResult<Option<Value>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn record_indexed(
        &self,
        marker: &str,
        counter: &str,
        scope_key: &str,
    ) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = self
            .record_script
            .key(marker)
            .key(counter)
            .arg(scope_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn remove_indexed(&self, marker: &str) -> StoreResult<Option<Removed>> {
        let mut conn = self.conn.clone();
        let removed: Option<(String, i64)> = self
            .remove_script
            .key(marker)
            .arg(COUNT_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed.map(|(scope_key, count)| Removed { scope_key, count }))
    }
}

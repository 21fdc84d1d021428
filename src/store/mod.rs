//! Counter store: the key-value contract the index is built on.
//!
//! Pluggable backends:
//! - In-memory (single process, not persisted)
//! - Redis (shared between the server and the indexer)

mod memory;

#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::InMemoryCounterStore;

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisCounterStore;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::scope::count_key;

/// Result type for counter store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from counter store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of removing an indexed annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    /// Scope key the annotation had been counted under.
    pub scope_key: String,
    /// Counter value after the decrement.
    pub count: i64,
}

/// Key-value operations required of the counter backend.
///
/// Implementations must support concurrent use from the request path and
/// the indexer. Increment and decrement must be atomic per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment an integer key, returning the new value.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Atomically decrement an integer key, returning the new value.
    async fn decr(&self, key: &str) -> StoreResult<i64>;

    /// Sum integer keys in one read. Missing or non-numeric values count as 0.
    async fn sum(&self, keys: &[String]) -> StoreResult<i64>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Store a JSON value that expires after `ttl`.
    async fn put_json_expiring(&self, key: &str, value: &Value, ttl: Duration) -> StoreResult<()>;

    async fn get_json(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Count an annotation under `counter` unless `marker` already exists.
    ///
    /// Returns the new counter value, or `None` when the annotation had
    /// already been indexed.
    ///
    /// The default runs the check, the increment and the marker write as
    /// separate calls. A failure after the increment leaves no marker, so a
    /// retry counts the annotation again. Backends that can do better
    /// override this with a single atomic operation.
    async fn record_indexed(
        &self,
        marker: &str,
        counter: &str,
        scope_key: &str,
    ) -> StoreResult<Option<i64>> {
        if self.get(marker).await?.is_some() {
            return Ok(None);
        }
        let count = self.incr(counter).await?;
        self.put(marker, scope_key).await?;
        Ok(Some(count))
    }

    /// Drop `marker` and decrement the counter it points at.
    ///
    /// Returns `None` when the marker does not exist. The default has the
    /// mirror image of the [`record_indexed`](Self::record_indexed) gap: a
    /// failure after the marker delete loses the decrement.
    async fn remove_indexed(&self, marker: &str) -> StoreResult<Option<Removed>> {
        let Some(scope_key) = self.get(marker).await? else {
            return Ok(None);
        };
        self.delete(marker).await?;
        let count = self.decr(&count_key(&scope_key)).await?;
        Ok(Some(Removed { scope_key, count }))
    }
}

/// Parse a stored counter value, treating anything non-numeric as 0.
pub(crate) fn counter_value(raw: Option<&str>) -> i64 {
    raw.and_then(|s| s.trim().parse::<i64>().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Delegates to an in-memory store through the trait's default
    /// two-step methods, failing the next `put` or `decr` on request.
    struct CrashingStore {
        inner: InMemoryCounterStore,
        fail_next_put: AtomicBool,
        fail_next_decr: AtomicBool,
    }

    impl CrashingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryCounterStore::new(),
                fail_next_put: AtomicBool::new(false),
                fail_next_decr: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl CounterStore for CrashingStore {
        async fn incr(&self, key: &str) -> StoreResult<i64> {
            self.inner.incr(key).await
        }

        async fn decr(&self, key: &str) -> StoreResult<i64> {
            if self.fail_next_decr.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.decr(key).await
        }

        async fn sum(&self, keys: &[String]) -> StoreResult<i64> {
            self.inner.sum(keys).await
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
            if self.fail_next_put.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.put(key, value).await
        }

        async fn put_json_expiring(
            &self,
            key: &str,
            value: &Value,
            ttl: Duration,
        ) -> StoreResult<()> {
            self.inner.put_json_expiring(key, value, ttl).await
        }

        async fn get_json(&self, key: &str) -> StoreResult<Option<Value>> {
            self.inner.get_json(key).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn two_step_default_counts_once_without_failures() {
        let store = CrashingStore::new();
        let first = store
            .record_indexed("ann|a1", "count|k", "k")
            .await
            .unwrap();
        let replay = store
            .record_indexed("ann|a1", "count|k", "k")
            .await
            .unwrap();

        assert_eq!(first, Some(1));
        assert_eq!(replay, None);
    }

    #[tokio::test]
    async fn crash_between_increment_and_marker_double_counts_on_retry() {
        let store = CrashingStore::new();
        store.fail_next_put.store(true, Ordering::SeqCst);

        assert!(store.record_indexed("ann|a1", "count|k", "k").await.is_err());
        assert_eq!(store.get("count|k").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("ann|a1").await.unwrap(), None);

        // The retry cannot see the earlier increment.
        let retried = store
            .record_indexed("ann|a1", "count|k", "k")
            .await
            .unwrap();
        assert_eq!(retried, Some(2));
    }

    #[tokio::test]
    async fn crash_between_marker_delete_and_decrement_loses_decrement() {
        let store = CrashingStore::new();
        store.record_indexed("ann|a1", "count|k", "k").await.unwrap();
        store.fail_next_decr.store(true, Ordering::SeqCst);

        assert!(store.remove_indexed("ann|a1").await.is_err());
        assert_eq!(store.remove_indexed("ann|a1").await.unwrap(), None);
        assert_eq!(store.get("count|k").await.unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn counter_value_parsing() {
        assert_eq!(counter_value(Some("3")), 3);
        assert_eq!(counter_value(Some("-1")), -1);
        assert_eq!(counter_value(Some("abc")), 0);
        assert_eq!(counter_value(None), 0);
    }
}

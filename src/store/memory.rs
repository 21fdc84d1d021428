//! In-memory counter store for single-process operation.
//!
//! Lock-based store used by tests and by `serve --store memory`.
//! State is not persisted across restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{counter_value, CounterStore, Removed, StoreError, StoreResult};
use crate::scope::count_key;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-memory counter store.
///
/// `record_indexed` and `remove_indexed` run under a single write lock, so
/// the marker and the counter always change together.
#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.is_live()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn add(entries: &mut HashMap<String, Entry>, key: &str, delta: i64) -> StoreResult<i64> {
        let current = match entries.get(key).filter(|e| e.is_live()) {
            Some(entry) => entry.value.trim().parse::<i64>().map_err(|_| {
                StoreError::Backend(format!("value at {} is not an integer", key))
            })?,
            None => 0,
        };
        let next = current + delta;
        entries.insert(key.to_string(), Entry::new(next.to_string()));
        Ok(next)
    }

    fn live_value<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Option<&'a str> {
        entries
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.as_str())
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut entries = self.entries.write().await;
        Self::add(&mut entries, key, 1)
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        let mut entries = self.entries.write().await;
        Self::add(&mut entries, key, -1)
    }

    async fn sum(&self, keys: &[String]) -> StoreResult<i64> {
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|k| counter_value(Self::live_value(&entries, k)))
            .sum())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(Self::live_value(&entries, key).map(str::to_string))
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Entry::new(value.to_string()));
        Ok(())
    }

    async fn put_json_expiring(&self, key: &str, value: &Value, ttl: Duration) -> StoreResult<()> {
        let encoded = serde_json::to_string(value)?;
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: encoded,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get_json(&self, key: &str) -> StoreResult<Option<Value>> {
        let raw = self.get(key).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn record_indexed(
        &self,
        marker: &str,
        counter: &str,
        scope_key: &str,
    ) -> StoreResult<Option<i64>> {
        let mut entries = self.entries.write().await;
        if Self::live_value(&entries, marker).is_some() {
            return Ok(None);
        }
        let count = Self::add(&mut entries, counter, 1)?;
        entries.insert(marker.to_string(), Entry::new(scope_key.to_string()));
        Ok(Some(count))
    }

    async fn remove_indexed(&self, marker: &str) -> StoreResult<Option<Removed>> {
        let mut entries = self.entries.write().await;
        let Some(scope_key) = Self::live_value(&entries, marker).map(str::to_string) else {
            return Ok(None);
        };
        let count = Self::add(&mut entries, &count_key(&scope_key), -1)?;
        entries.remove(marker);
        Ok(Some(Removed { scope_key, count }))
    }
}

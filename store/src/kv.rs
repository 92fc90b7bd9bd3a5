use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Durable key-value + hash + sorted-set + list abstraction shared by every
/// engine.
///
/// Semantics follow the conventional KV-server contract:
/// - values are opaque strings (the engines store JSON);
/// - a missing key is `Ok(None)` / empty, never an error;
/// - expired keys behave exactly like missing keys;
/// - `scan` patterns support `*` wildcards only.
///
/// Keys are namespaced by the caller (see [`crate::keys`]); no two engines
/// write the same key space.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically add `by` to an integer hash field, creating the hash and
    /// the field as needed. Returns the new value.
    async fn incr_hash_field(&self, key: &str, field: &str, by: i64)
    -> Result<i64, StoreError>;

    /// Set a hash field to an arbitrary string value.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Set or refresh a key's TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Members ordered by (score, member), `start`/`stop` inclusive with
    /// negative-from-the-end indexing.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError>;

    /// Removes members with `min <= score <= max`; returns how many.
    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError>;

    /// Push to the head of a list; returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Blocking pop from the tail; `Ok(None)` on timeout.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// Keep only `[start..=stop]` (inclusive, negative-from-the-end).
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    /// All live keys matching a `*`-wildcard pattern.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// JSON convenience layer over [`StateStore`].
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

/// `*`-wildcard matcher used by `scan` implementations.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;

    // First segment is anchored at the start.
    if let Some(first) = parts.first() {
        if !rest.starts_with(first) {
            return false;
        }
        rest = &rest[first.len()..];
    }

    // Middle segments match greedily left-to-right.
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }

    // Last segment is anchored at the end.
    let last = parts[parts.len() - 1];
    last.is_empty() || rest.ends_with(last)
}

/// Resolve Redis-style inclusive range indices against a collection length.
/// Returns `None` when the range selects nothing.
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }

    let norm = |i: i64| -> i64 {
        if i < 0 { (len + i).max(0) } else { i.min(len - 1) }
    };

    let (start, stop) = (norm(start), norm(stop));
    if start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

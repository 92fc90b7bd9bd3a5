use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use common::clock::{Clock, SystemClock};

use crate::error::StoreError;
use crate::kv::{StateStore, glob_match, resolve_range};

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Zset(HashMap<String, f64>),
    /// Front is the head (LPUSH side), back is the tail (BRPOP side).
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

/// In-memory [`StateStore`] used by tests and embedded deployments.
///
/// TTLs are evaluated against the injected clock so tests can expire keys
/// without sleeping. Expired entries are dropped lazily on access.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    list_signal: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            list_signal: Notify::new(),
        }
    }

    fn live(&self, entry: &Entry) -> bool {
        entry
            .expires_at_ms
            .is_none_or(|at| self.clock.now_ms() < at)
    }

    fn expires_at(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|t| self.clock.now_ms().saturating_add(t.as_millis() as u64))
    }

    /// Lock the map, drop the key if it expired, and hand the slot to `f`.
    fn visit<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, &str) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut map = self.entries.lock();
        if map.get(key).is_some_and(|e| !self.live(e)) {
            map.remove(key);
        }
        f(&mut map, key)
    }

    fn try_rpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.visit(key, |map, key| match map.get_mut(key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => {
                let popped = items.pop_back();
                if items.is_empty() {
                    map.remove(key);
                }
                Ok(popped)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.visit(key, |map, key| match map.get(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at_ms = self.expires_at(ttl);
        let mut map = self.entries.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.visit(key, |map, key| Ok(map.contains_key(key)))
    }

    async fn incr_hash_field(
        &self,
        key: &str,
        field: &str,
        by: i64,
    ) -> Result<i64, StoreError> {
        self.visit(key, |map, key| {
            let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at_ms: None,
            });
            match &mut entry.value {
                Value::Hash(fields) => {
                    let current = fields
                        .get(field)
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(0);
                    let next = current.saturating_add(by);
                    fields.insert(field.to_string(), next.to_string());
                    Ok(next)
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            }
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.visit(key, |map, key| {
            let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at_ms: None,
            });
            match &mut entry.value {
                Value::Hash(fields) => {
                    fields.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            }
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.visit(key, |map, key| match map.get(key) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(HashMap::new()),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let expires_at_ms = self.expires_at(Some(ttl));
        self.visit(key, |map, key| match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.visit(key, |map, key| {
            let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Zset(HashMap::new()),
                expires_at_ms: None,
            });
            match &mut entry.value {
                Value::Zset(members) => {
                    members.insert(member.to_string(), score);
                    Ok(())
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            }
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.visit(key, |map, key| match map.get_mut(key) {
            Some(Entry {
                value: Value::Zset(members),
                ..
            }) => {
                let removed = members.remove(member).is_some();
                if members.is_empty() {
                    map.remove(key);
                }
                Ok(removed)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(false),
        })
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.visit(key, |map, key| {
            let members = match map.get(key) {
                Some(Entry {
                    value: Value::Zset(members),
                    ..
                }) => members,
                Some(_) => return Err(StoreError::WrongType(key.to_string())),
                None => return Ok(vec![]),
            };

            let mut ordered: Vec<(&String, f64)> =
                members.iter().map(|(m, s)| (m, *s)).collect();
            ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

            Ok(match resolve_range(ordered.len(), start, stop) {
                Some((lo, hi)) => ordered[lo..=hi].iter().map(|(m, _)| (*m).clone()).collect(),
                None => vec![],
            })
        })
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.visit(key, |map, key| {
            let members = match map.get(key) {
                Some(Entry {
                    value: Value::Zset(members),
                    ..
                }) => members,
                Some(_) => return Err(StoreError::WrongType(key.to_string())),
                None => return Ok(vec![]),
            };

            let mut ordered: Vec<(&String, f64)> = members
                .iter()
                .filter(|(_, s)| min <= **s && **s <= max)
                .map(|(m, s)| (m, *s))
                .collect();
            ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

            Ok(ordered.into_iter().map(|(m, _)| m.clone()).collect())
        })
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        self.visit(key, |map, key| match map.get_mut(key) {
            Some(Entry {
                value: Value::Zset(members),
                ..
            }) => {
                let before = members.len();
                members.retain(|_, s| !(min <= *s && *s <= max));
                let removed = (before - members.len()) as u64;
                if members.is_empty() {
                    map.remove(key);
                }
                Ok(removed)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(0),
        })
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let len = self.visit(key, |map, key| {
            let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at_ms: None,
            });
            match &mut entry.value {
                Value::List(items) => {
                    items.push_front(value.to_string());
                    Ok(items.len() as u64)
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            }
        })?;
        self.list_signal.notify_waiters();
        Ok(len)
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so a push between check and wait still
            // wakes us.
            let notified = self.list_signal.notified();

            if let Some(v) = self.try_rpop(key)? {
                return Ok(Some(v));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Close the race between the timeout firing and a final push.
                return self.try_rpop(key);
            }
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.visit(key, |map, key| match map.get_mut(key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => {
                match resolve_range(items.len(), start, stop) {
                    Some((lo, hi)) => {
                        let kept: VecDeque<String> = items.drain(lo..=hi).collect();
                        *items = kept;
                    }
                    None => {
                        map.remove(key);
                    }
                }
                Ok(())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(()),
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.visit(key, |map, key| match map.get(key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(match resolve_range(items.len(), start, stop) {
                Some((lo, hi)) => items.iter().skip(lo).take(hi - lo + 1).cloned().collect(),
                None => vec![],
            }),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(vec![]),
        })
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let map = self.entries.lock();
        let mut keys: Vec<String> = map
            .iter()
            .filter(|(_, e)| self.live(e))
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let (store, _) = store_with_clock();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());

        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires_against_injected_clock() {
        let (store, clock) = store_with_clock();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        clock.advance_ms(9_999);
        assert!(store.exists("k").await.unwrap());

        clock.advance_ms(1);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_refreshes_and_reports_missing() {
        let (store, clock) = store_with_clock();
        assert!(!store.expire("k", Duration::from_secs(5)).await.unwrap());

        store.set("k", "v", Some(Duration::from_secs(1))).await.unwrap();
        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());

        clock.advance_ms(5_000);
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let (store, _) = store_with_clock();
        store.set("k", "v", None).await.unwrap();

        let err = store.lpush("k", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType(_)));

        let err = store.zadd("k", "m", 1.0).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType(_)));
    }

    #[tokio::test]
    async fn hash_counters_accumulate() {
        let (store, _) = store_with_clock();
        assert_eq!(store.incr_hash_field("h", "total", 1).await.unwrap(), 1);
        assert_eq!(store.incr_hash_field("h", "total", 2).await.unwrap(), 3);
        store.hset("h", "note", "hello").await.unwrap();

        let all = store.hash_get_all("h").await.unwrap();
        assert_eq!(all.get("total").unwrap(), "3");
        assert_eq!(all.get("note").unwrap(), "hello");
    }

    #[tokio::test]
    async fn zset_orders_by_score_then_member() {
        let (store, _) = store_with_clock();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "a", 2.0).await.unwrap();
        store.zadd("z", "c", 1.0).await.unwrap();

        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec!["c", "a", "b"]);
        assert_eq!(
            store.zrange_by_score("z", 2.0, 2.0).await.unwrap(),
            vec!["a", "b"]
        );

        assert_eq!(store.zrem_range_by_score("z", 0.0, 1.5).await.unwrap(), 1);
        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec!["a", "b"]);

        assert!(store.zrem("z", "a").await.unwrap());
        assert!(!store.zrem("z", "a").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_fifo_from_the_right() {
        let (store, _) = store_with_clock();
        store.lpush("l", "first").await.unwrap();
        store.lpush("l", "second").await.unwrap();
        store.lpush("l", "third").await.unwrap();

        assert_eq!(
            store.lrange("l", 0, -1).await.unwrap(),
            vec!["third", "second", "first"]
        );

        // BRPOP drains oldest-first.
        let v = store.brpop("l", Duration::from_millis(10)).await.unwrap();
        assert_eq!(v.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn ltrim_keeps_inclusive_window() {
        let (store, _) = store_with_clock();
        for i in 0..5 {
            store.lpush("l", &i.to_string()).await.unwrap();
        }
        // List is [4,3,2,1,0]; keep the two newest.
        store.ltrim("l", 0, 1).await.unwrap();
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["4", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn brpop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.brpop("q", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        store.lpush("q", "job").await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn brpop_times_out_empty() {
        let store = MemoryStore::new();
        let got = store.brpop("q", Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn scan_filters_by_pattern_and_liveness() {
        let (store, clock) = store_with_clock();
        store.set("retry:attempt:j1:1", "{}", None).await.unwrap();
        store
            .set("retry:attempt:j2:1", "{}", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set("retry:stats:a:b", "{}", None).await.unwrap();

        clock.advance_ms(2_000);

        let keys = store.scan("retry:attempt:*").await.unwrap();
        assert_eq!(keys, vec!["retry:attempt:j1:1"]);
    }
}

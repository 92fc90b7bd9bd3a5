use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use common::clock::{Clock, SystemClock};

struct CacheEntry<V> {
    value: V,
    expires_at_ms: u64,
}

/// Bounded in-memory read-through cache with per-entry TTL.
///
/// The access pattern is read-heavy with stable keys, so there is no LRU:
/// the TTL dominates. When an insert finds the cache at capacity it performs
/// a full expired-entry sweep first, then accepts the new entry.
pub struct TtlCache<V> {
    max_entries: usize,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self::with_clock(max_entries, default_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(max_entries: usize, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_entries: max_entries.max(1),
            default_ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value if present and unexpired; expired entries are
    /// removed on the way out.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if now < e.expires_at_ms => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();

        if entries.len() >= self.max_entries {
            let before = entries.len();
            entries.retain(|_, e| now < e.expires_at_ms);
            debug!(
                swept = before - entries.len(),
                size = entries.len(),
                "cache at capacity; swept expired entries"
            );
        }

        entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::debug;

use common::clock::{Clock, SystemClock};

use crate::error::StoreError;
use crate::kv::{StateStore, glob_match, resolve_range};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_hash (
  key TEXT NOT NULL,
  field TEXT NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (key, field)
);

CREATE TABLE IF NOT EXISTS kv_zset (
  key TEXT NOT NULL,
  member TEXT NOT NULL,
  score REAL NOT NULL,
  PRIMARY KEY (key, member)
);

CREATE TABLE IF NOT EXISTS kv_list (
  key TEXT NOT NULL,
  seq INTEGER NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (key, seq)
);

CREATE TABLE IF NOT EXISTS kv_expiry (
  key TEXT PRIMARY KEY,
  expires_at_ms INTEGER NOT NULL
);
"#;

/// How often `brpop` re-checks the list while blocking.
const BRPOP_POLL: Duration = Duration::from_millis(50);

/// SQLite-backed [`StateStore`] for single-node deployments.
///
/// TTLs live in a side table and are checked lazily: an expired key is purged
/// from every structure table the next time any operation touches it. Type
/// discipline is carried by the fixed key schema (each key pattern is only
/// ever used with one structure), so unlike the in-memory store this backend
/// does not detect cross-type misuse.
pub struct SqliteStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Connect and bootstrap the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_clock(url, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        url: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        let store = Self { pool, clock };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self {
            pool,
            clock: Arc::new(SystemClock),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        debug!("state store schema ready");
        Ok(())
    }

    /// Drop the key from every table if its TTL has passed.
    async fn purge_if_expired(&self, key: &str) -> Result<(), StoreError> {
        let now = self.clock.now_ms() as i64;
        let expired: Option<i64> =
            sqlx::query_scalar("SELECT expires_at_ms FROM kv_expiry WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        if expired.is_some_and(|at| at <= now) {
            self.purge(key).await?;
        }
        Ok(())
    }

    async fn purge(&self, key: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["kv", "kv_hash", "kv_zset", "kv_list", "kv_expiry"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE key = ?1"))
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let at = self.clock.now_ms() as i64 + ttl.as_millis() as i64;
        sqlx::query(
            "INSERT INTO kv_expiry (key, expires_at_ms) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET expires_at_ms = excluded.expires_at_ms",
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn key_present(&self, key: &str) -> Result<bool, StoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM kv WHERE key = ?1)
                  + (SELECT COUNT(*) FROM kv_hash WHERE key = ?1)
                  + (SELECT COUNT(*) FROM kv_zset WHERE key = ?1)
                  + (SELECT COUNT(*) FROM kv_list WHERE key = ?1)",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(n > 0)
    }

    async fn try_rpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT seq, value FROM kv_list WHERE key = ?1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let seq: i64 = row.get("seq");
        let value: String = row.get("value");

        sqlx::query("DELETE FROM kv_list WHERE key = ?1 AND seq = ?2")
            .bind(key)
            .bind(seq)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(value))
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.purge_if_expired(key).await?;
        let v = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(v)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        match ttl {
            Some(ttl) => self.set_expiry(key, ttl).await?,
            None => {
                sqlx::query("DELETE FROM kv_expiry WHERE key = ?1")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.purge(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.purge_if_expired(key).await?;
        self.key_present(key).await
    }

    async fn incr_hash_field(
        &self,
        key: &str,
        field: &str,
        by: i64,
    ) -> Result<i64, StoreError> {
        self.purge_if_expired(key).await?;
        let value: String = sqlx::query_scalar(
            "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, CAST(?3 AS TEXT))
             ON CONFLICT(key, field) DO UPDATE
               SET value = CAST(CAST(kv_hash.value AS INTEGER) + ?3 AS TEXT)
             RETURNING value",
        )
        .bind(key)
        .bind(field)
        .bind(by)
        .fetch_one(&self.pool)
        .await?;
        Ok(value.parse::<i64>().unwrap_or(0))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.purge_if_expired(key).await?;
        sqlx::query(
            "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.purge_if_expired(key).await?;
        let rows = sqlx::query("SELECT field, value FROM kv_hash WHERE key = ?1")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("field"), r.get::<String, _>("value")))
            .collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.purge_if_expired(key).await?;
        if !self.key_present(key).await? {
            return Ok(false);
        }
        self.set_expiry(key, ttl).await?;
        Ok(true)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.purge_if_expired(key).await?;
        sqlx::query(
            "INSERT INTO kv_zset (key, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
        )
        .bind(key)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM kv_zset WHERE key = ?1 AND member = ?2")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.purge_if_expired(key).await?;
        let members: Vec<String> = sqlx::query_scalar(
            "SELECT member FROM kv_zset WHERE key = ?1 ORDER BY score, member",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        Ok(match resolve_range(members.len(), start, stop) {
            Some((lo, hi)) => members[lo..=hi].to_vec(),
            None => vec![],
        })
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.purge_if_expired(key).await?;
        let members = sqlx::query_scalar(
            "SELECT member FROM kv_zset
             WHERE key = ?1 AND score >= ?2 AND score <= ?3
             ORDER BY score, member",
        )
        .bind(key)
        .bind(min)
        .bind(max)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        let res =
            sqlx::query("DELETE FROM kv_zset WHERE key = ?1 AND score >= ?2 AND score <= ?3")
                .bind(key)
                .bind(min)
                .bind(max)
                .execute(&self.pool)
                .await?;
        Ok(res.rows_affected())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.purge_if_expired(key).await?;
        let mut tx = self.pool.begin().await?;
        let head: Option<i64> =
            sqlx::query_scalar("SELECT MIN(seq) FROM kv_list WHERE key = ?1")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query("INSERT INTO kv_list (key, seq, value) VALUES (?1, ?2, ?3)")
            .bind(key)
            .bind(head.unwrap_or(0) - 1)
            .bind(value)
            .execute(&mut *tx)
            .await?;

        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_list WHERE key = ?1")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(len as u64)
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(v) = self.try_rpop(key).await? {
                return Ok(Some(v));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(BRPOP_POLL).await;
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let seqs: Vec<i64> =
            sqlx::query_scalar("SELECT seq FROM kv_list WHERE key = ?1 ORDER BY seq ASC")
                .bind(key)
                .fetch_all(&self.pool)
                .await?;

        match resolve_range(seqs.len(), start, stop) {
            Some((lo, hi)) => {
                sqlx::query("DELETE FROM kv_list WHERE key = ?1 AND (seq < ?2 OR seq > ?3)")
                    .bind(key)
                    .bind(seqs[lo])
                    .bind(seqs[hi])
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM kv_list WHERE key = ?1")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.purge_if_expired(key).await?;
        let values: Vec<String> =
            sqlx::query_scalar("SELECT value FROM kv_list WHERE key = ?1 ORDER BY seq ASC")
                .bind(key)
                .fetch_all(&self.pool)
                .await?;

        Ok(match resolve_range(values.len(), start, stop) {
            Some((lo, hi)) => values[lo..=hi].to_vec(),
            None => vec![],
        })
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_ms() as i64;
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT key FROM (
               SELECT key FROM kv
               UNION SELECT key FROM kv_hash
               UNION SELECT key FROM kv_zset
               UNION SELECT key FROM kv_list
             )
             WHERE key NOT IN (SELECT key FROM kv_expiry WHERE expires_at_ms <= ?1)
             ORDER BY key",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys
            .into_iter()
            .filter(|k| glob_match(pattern, k))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_roundtrip_and_overwrite() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set("k", "v1", None).await.unwrap();
        store.set("k", "v2", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        store.del("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn hash_and_zset_and_list_structures() {
        let store = SqliteStore::in_memory().await.unwrap();

        assert_eq!(store.incr_hash_field("h", "n", 5).await.unwrap(), 5);
        assert_eq!(store.incr_hash_field("h", "n", -2).await.unwrap(), 3);

        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 0.5).await.unwrap();
        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec!["b", "a"]);

        store.lpush("l", "x").await.unwrap();
        store.lpush("l", "y").await.unwrap();
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["y", "x"]);
        assert_eq!(
            store
                .brpop("l", Duration::from_millis(10))
                .await
                .unwrap()
                .as_deref(),
            Some("x")
        );
    }

    #[tokio::test]
    async fn ttl_expiry_purges_key() {
        use common::clock::ManualClock;

        let clock = ManualClock::new(1_000_000);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore {
            pool,
            clock: Arc::new(clock.clone()),
        };
        store.migrate().await.unwrap();

        store
            .set("k", "v", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        clock.advance_ms(1_001);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ltrim_keeps_head_window() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..5 {
            store.lpush("l", &i.to_string()).await.unwrap();
        }
        store.ltrim("l", 0, 2).await.unwrap();
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn scan_returns_keys_across_structures() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set("retry:strategy", "[]", None).await.unwrap();
        store.zadd("workers:index", "w-1", 0.0).await.unwrap();
        store.lpush("worker:audit_logs", "{}").await.unwrap();

        let keys = store.scan("worker*").await.unwrap();
        assert_eq!(keys, vec!["worker:audit_logs", "workers:index"]);
    }
}

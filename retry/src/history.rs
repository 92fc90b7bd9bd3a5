use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, instrument, warn};

use common::clock::Clock;
use common::events::{Event, EventKind, EventBus};
use common::logger::timed;
use store::cache::TtlCache;
use store::keys::KeySpace;
use store::{StateStore, StateStoreExt};

use crate::error::RetryError;
use crate::types::{AggregatedStats, AttemptRecord};

#[derive(Clone, Debug)]
pub struct AttemptStoreConfig {
    /// Fraction of attempts persisted, in [0, 1].
    pub sample_rate: f64,
    /// How long attempt records are retained before the TTL reaps them.
    pub retention: Duration,
    pub stats_cache_ttl: Duration,
    pub stats_cache_entries: usize,
}

impl Default for AttemptStoreConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            retention: Duration::from_secs(7 * 24 * 3600),
            stats_cache_ttl: Duration::from_secs(60),
            stats_cache_entries: 1_024,
        }
    }
}

/// Persists sampled attempt records and keeps the per-(queue, error-class)
/// counters that derive from them.
///
/// Both the Bayesian engine and the supervised predictor read history through
/// this type; neither writes it.
pub struct AttemptStore {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: AttemptStoreConfig,
    stats_cache: TtlCache<AggregatedStats>,
    rng: Mutex<StdRng>,
}

impl AttemptStore {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: AttemptStoreConfig,
    ) -> Self {
        let stats_cache = TtlCache::with_clock(
            config.stats_cache_entries,
            config.stats_cache_ttl,
            Arc::clone(&clock),
        );
        Self {
            store,
            bus,
            clock,
            config,
            stats_cache,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sampling for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Record one attempt. Returns whether the record was sampled in.
    ///
    /// Counters are bumped atomically in the store so concurrent workers
    /// cannot lose increments; the derived stats cache is invalidated.
    #[instrument(
        skip(self, ks, rec),
        target = "retry_history",
        fields(job_id = %rec.job_id, attempt = rec.attempt_number)
    )]
    pub async fn record(&self, ks: &KeySpace, rec: &AttemptRecord) -> Result<bool, RetryError> {
        if rec.attempt_number == 0 {
            return Err(RetryError::Config(
                "attempt_number must be >= 1".to_string(),
            ));
        }
        if rec.time_of_day > 23 {
            return Err(RetryError::Config("time_of_day must be in [0,23]".to_string()));
        }

        let draw: f64 = self.rng.lock().r#gen();
        if draw >= self.config.sample_rate {
            debug!("attempt skipped by sampling");
            return Ok(false);
        }

        let key = ks.attempt(&rec.job_id, rec.attempt_number);
        self.store
            .set_json(&key, rec, Some(self.config.retention))
            .await?;

        let error_class = rec.error_class.as_deref().unwrap_or("none");
        let stats_key = ks.stats(&rec.job_type, error_class);
        self.store
            .incr_hash_field(&stats_key, "total_attempts", 1)
            .await?;
        if rec.attempt_number > 1 {
            let field = if rec.success {
                "successful_retries"
            } else {
                "failed_retries"
            };
            self.store.incr_hash_field(&stats_key, field, 1).await?;
        }
        self.store
            .hset(&stats_key, "last_updated", &self.clock.now().to_rfc3339())
            .await?;

        self.stats_cache.invalidate(&stats_key);

        self.bus.publish(
            Event::new(EventKind::AttemptRecorded, "attempt recorded", self.clock.now())
                .with("job_id", &rec.job_id)
                .with("job_type", &rec.job_type)
                .with("attempt", rec.attempt_number)
                .with("success", rec.success),
        );

        Ok(true)
    }

    /// All retained attempts newer than `window`, oldest first.
    pub async fn scan_recent(
        &self,
        ks: &KeySpace,
        window: Duration,
    ) -> Result<Vec<AttemptRecord>, RetryError> {
        let cutoff: DateTime<Utc> = self.clock.now()
            - chrono::Duration::milliseconds(window.as_millis() as i64);

        let (scanned, elapsed) = timed("attempt_scan", Duration::from_millis(250), async {
            self.store.scan(&ks.attempt_scan()).await
        })
        .await;
        let keys = scanned?;
        debug!(
            keys = keys.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "attempt key scan complete"
        );

        let mut out = Vec::new();
        for key in keys {
            match self.store.get_json::<AttemptRecord>(&key).await {
                Ok(Some(rec)) if rec.timestamp >= cutoff => out.push(rec),
                Ok(_) => {}
                Err(e) => {
                    // One bad record must not poison a model rebuild.
                    warn!(key = %key, error = %e, "skipping unreadable attempt record");
                }
            }
        }
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    /// Attempts for one (job_type, error_class) pair within `window`.
    pub async fn scan_window(
        &self,
        ks: &KeySpace,
        job_type: &str,
        error_class: &str,
        window: Duration,
    ) -> Result<Vec<AttemptRecord>, RetryError> {
        let mut out = self.scan_recent(ks, window).await?;
        out.retain(|r| {
            r.job_type == job_type && r.error_class.as_deref().unwrap_or("none") == error_class
        });
        Ok(out)
    }

    /// Cached read of the aggregated counters for a (job_type, error_class).
    pub async fn aggregated(
        &self,
        ks: &KeySpace,
        job_type: &str,
        error_class: &str,
    ) -> Result<AggregatedStats, RetryError> {
        let key = ks.stats(job_type, error_class);
        if let Some(stats) = self.stats_cache.get(&key) {
            return Ok(stats);
        }

        let fields = self.store.hash_get_all(&key).await?;
        let read = |name: &str| -> u64 {
            fields
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        let stats = AggregatedStats {
            total_attempts: read("total_attempts"),
            successful_retries: read("successful_retries"),
            failed_retries: read("failed_retries"),
            last_updated: fields
                .get("last_updated")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
        };

        self.stats_cache.insert(key, stats.clone());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::clock::ManualClock;
    use store::MemoryStore;

    fn mk_attempt(job_id: &str, attempt: u32, success: bool, ts: DateTime<Utc>) -> AttemptRecord {
        AttemptRecord {
            job_id: job_id.into(),
            job_type: "email".into(),
            queue: "default".into(),
            tenant: None,
            error_class: Some("timeout".into()),
            error_code: None,
            attempt_number: attempt,
            delay_ms: 2_000,
            success,
            payload_size: 64,
            time_of_day: 10,
            worker_version: "1.0".into(),
            health_signals: Default::default(),
            processing_time_ms: 100,
            timestamp: ts,
        }
    }

    fn setup() -> (AttemptStore, KeySpace, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let attempts = AttemptStore::new(
            store,
            EventBus::default(),
            Arc::new(clock.clone()),
            AttemptStoreConfig::default(),
        )
        .with_seed(7);
        (attempts, KeySpace::default(), clock)
    }

    #[tokio::test]
    async fn record_persists_and_counts() {
        let (attempts, ks, clock) = setup();
        let now = clock.now();

        assert!(attempts.record(&ks, &mk_attempt("j1", 1, false, now)).await.unwrap());
        assert!(attempts.record(&ks, &mk_attempt("j1", 2, true, now)).await.unwrap());
        assert!(attempts.record(&ks, &mk_attempt("j2", 2, false, now)).await.unwrap());

        let stats = attempts.aggregated(&ks, "email", "timeout").await.unwrap();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.successful_retries, 1);
        assert_eq!(stats.failed_retries, 1);
        assert!(stats.last_updated.is_some());
        assert!((stats.success_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn record_rejects_invalid_attempts() {
        let (attempts, ks, clock) = setup();
        let mut rec = mk_attempt("j1", 0, false, clock.now());
        assert!(matches!(
            attempts.record(&ks, &rec).await,
            Err(RetryError::Config(_))
        ));

        rec.attempt_number = 1;
        rec.time_of_day = 24;
        assert!(matches!(
            attempts.record(&ks, &rec).await,
            Err(RetryError::Config(_))
        ));
    }

    #[tokio::test]
    async fn zero_sample_rate_skips_everything() {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let attempts = AttemptStore::new(
            store,
            EventBus::default(),
            Arc::new(clock.clone()),
            AttemptStoreConfig {
                sample_rate: 0.0,
                ..Default::default()
            },
        );
        let ks = KeySpace::default();

        let stored = attempts
            .record(&ks, &mk_attempt("j1", 1, false, clock.now()))
            .await
            .unwrap();
        assert!(!stored);

        let stats = attempts.aggregated(&ks, "email", "timeout").await.unwrap();
        assert_eq!(stats.total_attempts, 0);
    }

    #[tokio::test]
    async fn scan_window_filters_key_and_age() {
        let (attempts, ks, clock) = setup();
        let now = clock.now();

        let old = now - chrono::Duration::days(40);
        attempts.record(&ks, &mk_attempt("old", 1, true, old)).await.unwrap();
        attempts.record(&ks, &mk_attempt("new", 1, true, now)).await.unwrap();

        let mut other = mk_attempt("other", 1, true, now);
        other.error_class = Some("oom".into());
        attempts.record(&ks, &other).await.unwrap();

        let window = Duration::from_secs(30 * 24 * 3600);
        let hits = attempts.scan_window(&ks, "email", "timeout", window).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].job_id, "new");
    }

    #[tokio::test]
    async fn attempt_recorded_event_is_published() {
        let (attempts, ks, clock) = setup();
        let mut rx = attempts.bus.subscribe();

        attempts
            .record(&ks, &mk_attempt("j1", 1, false, clock.now()))
            .await
            .unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::AttemptRecorded);
        assert_eq!(ev.data.get("job_id").unwrap(), "j1");
    }
}

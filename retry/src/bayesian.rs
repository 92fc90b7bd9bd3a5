use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use common::clock::Clock;
use common::events::{Event, EventBus, EventKind};
use store::cache::TtlCache;
use store::keys::KeySpace;
use store::{StateStore, StateStoreExt};

use crate::error::RetryError;
use crate::history::AttemptStore;
use crate::types::AttemptRecord;

/// Fixed delay partition. Half-open `[min, max)` intervals covering the
/// non-negative axis; the final bucket is unbounded.
pub const DELAY_BUCKETS_MS: [(u64, Option<u64>); 8] = [
    (0, Some(1_000)),
    (1_000, Some(5_000)),
    (5_000, Some(15_000)),
    (15_000, Some(30_000)),
    (30_000, Some(60_000)),
    (60_000, Some(300_000)),
    (300_000, Some(900_000)),
    (900_000, None),
];

const Z_95: f64 = 1.96;

/// Beta-posterior success estimate for one delay bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BayesianBucket {
    pub delay_min_ms: u64,
    /// Exclusive upper edge; `None` for the unbounded tail.
    pub delay_max_ms: Option<u64>,
    pub successes: u64,
    pub failures: u64,
    /// Posterior mean `(s+1)/(s+f+2)`.
    pub probability: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl BayesianBucket {
    pub fn contains(&self, delay_ms: u64) -> bool {
        delay_ms >= self.delay_min_ms && self.delay_max_ms.is_none_or(|max| delay_ms < max)
    }

    /// Representative delay for the bucket: the midpoint, or twice the lower
    /// edge for the unbounded tail.
    pub fn midpoint_ms(&self) -> u64 {
        match self.delay_max_ms {
            Some(max) => (self.delay_min_ms + max) / 2,
            None => self.delay_min_ms.saturating_mul(2),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BayesianModel {
    pub job_type: String,
    pub error_class: String,
    pub buckets: Vec<BayesianBucket>,
    pub sample_count: u64,
    pub last_updated: DateTime<Utc>,
    /// Overall model confidence in [0, 1], saturating with sample volume.
    pub confidence: f64,
}

impl BayesianModel {
    /// The bucket to recommend at `threshold`: highest probability among
    /// those clearing the threshold whose lower bound also clears 80% of it.
    /// Probability ties break toward the tighter (higher) lower bound.
    pub fn best_bucket(&self, threshold: f64) -> Option<&BayesianBucket> {
        self.buckets
            .iter()
            .filter(|b| b.probability >= threshold && b.lower_bound >= 0.8 * threshold)
            .max_by(|a, b| {
                a.probability
                    .total_cmp(&b.probability)
                    .then(a.lower_bound.total_cmp(&b.lower_bound))
            })
    }
}

/// Build bucket posteriors from a set of attempts.
///
/// Pure: two calls over the same attempt set produce the same buckets, which
/// is what makes concurrent model updates safe (last writer wins).
pub fn build_buckets(attempts: &[AttemptRecord]) -> Vec<BayesianBucket> {
    let mut counts: [(u64, u64); DELAY_BUCKETS_MS.len()] = Default::default();

    for rec in attempts {
        let idx = DELAY_BUCKETS_MS
            .iter()
            .position(|(min, max)| rec.delay_ms >= *min && max.is_none_or(|m| rec.delay_ms < m))
            .unwrap_or(DELAY_BUCKETS_MS.len() - 1);
        if rec.success {
            counts[idx].0 += 1;
        } else {
            counts[idx].1 += 1;
        }
    }

    DELAY_BUCKETS_MS
        .iter()
        .zip(counts.iter())
        .filter(|(_, (s, f))| s + f > 0)
        .map(|((min, max), (successes, failures))| {
            let alpha = *successes as f64 + 1.0;
            let beta = *failures as f64 + 1.0;
            let n = alpha + beta;
            let probability = alpha / n;
            let variance = alpha * beta / (n * n * (n + 1.0));
            let half_width = Z_95 * variance.sqrt();

            BayesianBucket {
                delay_min_ms: *min,
                delay_max_ms: *max,
                successes: *successes,
                failures: *failures,
                probability,
                lower_bound: (probability - half_width).max(0.0),
                upper_bound: (probability + half_width).min(1.0),
            }
        })
        .collect()
}

/// Sample-weighted confidence: per-bucket certainty (interval tightness,
/// saturating at 20 samples) averaged by bucket weight, then discounted until
/// 50 total samples are seen.
pub fn model_confidence(buckets: &[BayesianBucket], total_samples: u64) -> f64 {
    let total_weight: f64 = buckets.iter().map(|b| (b.successes + b.failures) as f64).sum();
    if total_weight == 0.0 {
        return 0.0;
    }

    let weighted: f64 = buckets
        .iter()
        .map(|b| {
            let samples = (b.successes + b.failures) as f64;
            let saturation = (samples / 20.0).min(1.0);
            let tightness = 1.0 - (b.upper_bound - b.lower_bound);
            samples * saturation * tightness.max(0.0)
        })
        .sum();

    let volume = (total_samples as f64 / 50.0).min(1.0);
    ((weighted / total_weight) * volume).clamp(0.0, 1.0)
}

#[derive(Clone, Debug)]
pub struct BayesianConfig {
    pub min_samples: usize,
    /// History window scanned on update.
    pub window: Duration,
    /// Persisted model TTL.
    pub model_ttl: Duration,
    pub cache_entries: usize,
    pub cache_ttl: Duration,
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            window: Duration::from_secs(30 * 24 * 3600),
            model_ttl: Duration::from_secs(7 * 24 * 3600),
            cache_entries: 512,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Maintains per-(job_type, error_class) success-probability models.
///
/// Updates for the same key are serialized by a keyed lock; reads go through
/// a bounded TTL cache backed by the store.
pub struct BayesianEngine {
    store: Arc<dyn StateStore>,
    attempts: Arc<AttemptStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: BayesianConfig,
    cache: TtlCache<BayesianModel>,
    update_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BayesianEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        attempts: Arc<AttemptStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: BayesianConfig,
    ) -> Self {
        let cache = TtlCache::with_clock(
            config.cache_entries,
            config.cache_ttl,
            Arc::clone(&clock),
        );
        Self {
            store,
            attempts,
            bus,
            clock,
            config,
            cache,
            update_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.update_locks
                .lock()
                .entry(key.to_string())
                .or_default(),
        )
    }

    /// Rebuild the model for a key from recent history.
    #[instrument(skip(self, ks), target = "bayesian")]
    pub async fn update(
        &self,
        ks: &KeySpace,
        job_type: &str,
        error_class: &str,
    ) -> Result<BayesianModel, RetryError> {
        let key = ks.bayesian(job_type, error_class);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let attempts = self
            .attempts
            .scan_window(ks, job_type, error_class, self.config.window)
            .await?;

        if attempts.len() < self.config.min_samples {
            debug!(got = attempts.len(), "insufficient samples for bayesian model");
            return Err(RetryError::InsufficientData {
                needed: self.config.min_samples,
                got: attempts.len(),
            });
        }

        let buckets = build_buckets(&attempts);
        let sample_count = attempts.len() as u64;
        let model = BayesianModel {
            job_type: job_type.to_string(),
            error_class: error_class.to_string(),
            confidence: model_confidence(&buckets, sample_count),
            buckets,
            sample_count,
            last_updated: self.clock.now(),
        };

        self.store
            .set_json(&key, &model, Some(self.config.model_ttl))
            .await?;
        self.cache.invalidate(&key);

        self.bus.publish(
            Event::new(EventKind::BayesianUpdated, "bayesian model rebuilt", self.clock.now())
                .with("job_type", job_type)
                .with("error_class", error_class)
                .with("samples", sample_count)
                .with("confidence", model.confidence),
        );

        info!(
            samples = sample_count,
            buckets = model.buckets.len(),
            confidence = model.confidence,
            "bayesian model updated"
        );
        Ok(model)
    }

    /// Current model for a key, if one exists. Read-through cached.
    pub async fn get(
        &self,
        ks: &KeySpace,
        job_type: &str,
        error_class: &str,
    ) -> Result<Option<BayesianModel>, RetryError> {
        let key = ks.bayesian(job_type, error_class);
        if let Some(model) = self.cache.get(&key) {
            return Ok(Some(model));
        }

        match self.store.get_json::<BayesianModel>(&key).await? {
            Some(model) => {
                self.cache.insert(key, model.clone());
                Ok(Some(model))
            }
            None => Ok(None),
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]
        #[test]
        fn bucket_posteriors_are_well_formed(
            outcomes in prop::collection::vec((0u64..2_000_000, any::<bool>()), 1..200)
        ) {
            let ts = chrono::Utc::now();
            let attempts: Vec<AttemptRecord> = outcomes
                .iter()
                .map(|(delay, success)| AttemptRecord {
                    job_id: "j".into(),
                    job_type: "email".into(),
                    queue: "default".into(),
                    tenant: None,
                    error_class: Some("timeout".into()),
                    error_code: None,
                    attempt_number: 2,
                    delay_ms: *delay,
                    success: *success,
                    payload_size: 0,
                    time_of_day: 0,
                    worker_version: "1.0".into(),
                    health_signals: Default::default(),
                    processing_time_ms: 10,
                    timestamp: ts,
                })
                .collect();

            let buckets = build_buckets(&attempts);

            let total: u64 = buckets.iter().map(|b| b.successes + b.failures).sum();
            prop_assert_eq!(total, attempts.len() as u64);

            for b in &buckets {
                let expected = (b.successes as f64 + 1.0)
                    / (b.successes as f64 + b.failures as f64 + 2.0);
                prop_assert!((b.probability - expected).abs() < 1e-9);
                prop_assert!(b.lower_bound <= b.probability);
                prop_assert!(b.probability <= b.upper_bound);
                prop_assert!((0.0..=1.0).contains(&b.lower_bound));
                prop_assert!((0.0..=1.0).contains(&b.upper_bound));
            }

            let confidence = model_confidence(&buckets, total);
            prop_assert!((0.0..=1.0).contains(&confidence));
        }
    }
}

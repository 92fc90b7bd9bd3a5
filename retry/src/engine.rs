use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, instrument, warn};

use common::clock::Clock;
use common::events::{Event, EventBus, EventKind};
use common::tenant::TenantContext;
use store::keys::KeySpace;

use crate::bayesian::BayesianEngine;
use crate::counters::Counters;
use crate::error::RetryError;
use crate::history::AttemptStore;
use crate::policy::{RetryPolicy, StrategyStore, is_validation_error};
use crate::supervised::Predictor;
use crate::types::{
    AttemptRecord, DecisionMethod, Guardrails, PreviewStep, RetryFeatures, RetryRecommendation,
};

/// Hard ceiling on supervised-tier delays, independent of guardrails.
const SUPERVISED_DELAY_CAP_MS: u64 = 300_000;

/// Default-tier backoff ceiling.
const DEFAULT_DELAY_CAP_MS: u64 = 30_000;

#[derive(Clone, Debug)]
pub struct RetryEngineConfig {
    /// Minimum bucket probability (and derived confidence) the Bayesian tier
    /// must clear to decide.
    pub bayesian_threshold: f64,
    /// Base delay fed into the supervised tier's inverse mapping.
    pub supervised_base_delay_ms: u64,
    /// Attempt ceiling for the default tier.
    pub default_max_attempts: u32,
    /// Upper bound on preview length.
    pub preview_cap: u32,
}

impl Default for RetryEngineConfig {
    fn default() -> Self {
        Self {
            bayesian_threshold: 0.7,
            supervised_base_delay_ms: 1_000,
            default_max_attempts: 3,
            preview_cap: 20,
        }
    }
}

impl RetryEngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("RETRY_BAYESIAN_THRESHOLD") {
            if let Ok(t) = v.parse::<f64>() {
                cfg.bayesian_threshold = t.clamp(0.0, 1.0);
            }
        }
        if let Ok(v) = std::env::var("RETRY_SUPERVISED_BASE_DELAY_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.supervised_base_delay_ms = ms.max(1);
            }
        }
        cfg
    }
}

/// The Retry Decision Engine: a fixed cascade of tiers, each returning
/// `Option<RetryRecommendation>`; the first `Some` wins.
///
/// `recommend` never fails for business reasons. Supervised and Bayesian
/// failures fall through; a store outage degrades the result to the rules or
/// default tier with the degradation noted in the rationale.
pub struct RetryEngine {
    config: RetryEngineConfig,
    strategy: Arc<StrategyStore>,
    bayesian: Arc<BayesianEngine>,
    predictor: Arc<Predictor>,
    attempts: Arc<AttemptStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    pub counters: Counters,
}

impl RetryEngine {
    pub fn new(
        config: RetryEngineConfig,
        strategy: Arc<StrategyStore>,
        bayesian: Arc<BayesianEngine>,
        predictor: Arc<Predictor>,
        attempts: Arc<AttemptStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            strategy,
            bayesian,
            predictor,
            attempts,
            bus,
            clock,
            rng: Mutex::new(StdRng::from_entropy()),
            counters: Counters::default(),
        }
    }

    /// Deterministic jitter for tests.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Produce a recommendation for a failing attempt.
    ///
    /// Tier order is fixed: guardrails, supervised (canary-gated), Bayesian,
    /// rules (with HTTP-class overrides), default.
    #[instrument(
        skip(self, ctx, features),
        target = "retry_engine",
        fields(job_type = %features.job_type, attempt = features.attempt_number)
    )]
    pub async fn recommend(
        &self,
        ctx: &TenantContext,
        features: &RetryFeatures,
    ) -> RetryRecommendation {
        self.counters.rec_total.fetch_add(1, Ordering::Relaxed);

        let ks = KeySpace::for_tenant(ctx);
        let guardrails = self.strategy.guardrails();

        if let Some(rec) = self.guardrail_tier(&guardrails, features) {
            self.counters.rec_guardrails.fetch_add(1, Ordering::Relaxed);
            self.bus.publish(
                Event::new(EventKind::GuardrailTriggered, "guardrail stopped retry", self.clock.now())
                    .with("job_type", &features.job_type)
                    .with("guardrails", &rec.policy_guardrails),
            );
            return self.finish(&guardrails, rec);
        }

        if let Some(rec) = self.supervised_tier(&guardrails, features) {
            self.counters.rec_supervised.fetch_add(1, Ordering::Relaxed);
            return self.finish(&guardrails, rec);
        }

        let mut degraded = false;
        if let Some(rec) = self.bayesian_tier(&ks, features, &mut degraded).await {
            self.counters.rec_bayesian.fetch_add(1, Ordering::Relaxed);
            return self.finish(&guardrails, rec);
        }

        if let Some(rec) = self.rules_tier(&guardrails, features) {
            self.counters.rec_rules.fetch_add(1, Ordering::Relaxed);
            return self.finish(&guardrails, rec);
        }

        self.counters.rec_default.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.counters.rec_degraded.fetch_add(1, Ordering::Relaxed);
        }
        let rec = self.default_tier(features, degraded);
        self.finish(&guardrails, rec)
    }

    /// Record an attempt outcome and opportunistically rebuild the Bayesian
    /// model for its key when no fresh model exists.
    ///
    /// Returns whether the attempt was sampled in. Model staleness is a
    /// best-effort refresh; insufficient data is expected and ignored.
    pub async fn record_outcome(
        &self,
        ctx: &TenantContext,
        rec: &AttemptRecord,
    ) -> Result<bool, RetryError> {
        let ks = KeySpace::for_tenant(ctx);
        let stored = self.attempts.record(&ks, rec).await?;
        if !stored {
            return Ok(false);
        }

        if let Some(error_class) = rec.error_class.as_deref() {
            let stale = match self.bayesian.get(&ks, &rec.job_type, error_class).await {
                Ok(Some(model)) => {
                    self.clock.now() - model.last_updated > ChronoDuration::hours(1)
                }
                Ok(None) => true,
                // A degraded store read is not the moment to rebuild.
                Err(_) => false,
            };
            if stale {
                match self.bayesian.update(&ks, &rec.job_type, error_class).await {
                    Ok(_) | Err(RetryError::InsufficientData { .. }) => {}
                    Err(e) => warn!(error = %e, "opportunistic bayesian refresh failed"),
                }
            }
        }
        Ok(true)
    }

    /// Preview the retry schedule from the current attempt forward.
    ///
    /// Iterates `recommend` with an incremented attempt number, accumulating
    /// wall-clock delay; stops at the first non-retry.
    pub async fn preview(
        &self,
        ctx: &TenantContext,
        features: &RetryFeatures,
        max_attempts: u32,
    ) -> Vec<PreviewStep> {
        let mut out = Vec::new();
        let mut cumulative = 0u64;
        let mut probe = features.clone();

        for i in 0..max_attempts.min(self.config.preview_cap) {
            probe.attempt_number = features.attempt_number.saturating_add(i);
            let rec = self.recommend(ctx, &probe).await;

            cumulative = cumulative.saturating_add(rec.delay_ms);
            let retrying = rec.should_retry;
            out.push(PreviewStep {
                attempt: probe.attempt_number,
                delay_ms: rec.delay_ms,
                cumulative_delay_ms: cumulative,
                should_retry: retrying,
                method: rec.method,
                confidence: rec.confidence,
            });

            if !retrying {
                break;
            }
        }
        out
    }

    // ---- tiers -------------------------------------------------------------

    fn guardrail_tier(
        &self,
        guardrails: &Guardrails,
        features: &RetryFeatures,
    ) -> Option<RetryRecommendation> {
        let mut fired = Vec::new();
        if features.attempt_number >= guardrails.max_attempts {
            fired.push("max_attempts".to_string());
        }
        if guardrails.emergency_stop {
            fired.push("emergency_stop".to_string());
        }
        if fired.is_empty() {
            return None;
        }

        let rationale = if fired.iter().any(|g| g == "emergency_stop") {
            "emergency stop is set; retries are halted".to_string()
        } else {
            format!(
                "attempt {} reached the max_attempts guardrail ({})",
                features.attempt_number, guardrails.max_attempts
            )
        };

        Some(RetryRecommendation {
            should_retry: false,
            delay_ms: 0,
            max_attempts: guardrails.max_attempts,
            confidence: 1.0,
            estimated_success: 0.0,
            method: DecisionMethod::Guardrails,
            rationale,
            policy_guardrails: fired,
            next_evaluation_time: self.clock.now(),
        })
    }

    fn supervised_tier(
        &self,
        guardrails: &Guardrails,
        features: &RetryFeatures,
    ) -> Option<RetryRecommendation> {
        if !self.predictor.is_enabled() || !self.predictor.canary_gate() {
            return None;
        }

        let (p, confidence) = match self.predictor.score(features) {
            Ok(scored) => scored,
            Err(e) => {
                // Any scoring failure falls through to the next tier.
                warn!(error = %e, "supervised scoring failed; falling through");
                return None;
            }
        };

        // Inverse mapping: lower success probability stretches the backoff.
        let attempt = features.attempt_number.max(1);
        let exp = 2f64.powi((attempt - 1).min(30) as i32);
        let raw = self.config.supervised_base_delay_ms as f64 * exp * ((1.0 - p) + 0.5);
        let delay_ms = (raw as u64)
            .min(guardrails.max_delay_ms)
            .min(SUPERVISED_DELAY_CAP_MS);

        Some(RetryRecommendation {
            should_retry: true,
            delay_ms,
            max_attempts: guardrails.max_attempts,
            confidence,
            estimated_success: p,
            method: DecisionMethod::Supervised,
            rationale: format!(
                "supervised model scored success probability {p:.2} for attempt {attempt}"
            ),
            policy_guardrails: vec![],
            next_evaluation_time: self.clock.now(),
        })
    }

    async fn bayesian_tier(
        &self,
        ks: &KeySpace,
        features: &RetryFeatures,
        degraded: &mut bool,
    ) -> Option<RetryRecommendation> {
        let error_class = features.error_class.as_deref()?;

        let model = match self.bayesian.get(ks, &features.job_type, error_class).await {
            Ok(Some(model)) => model,
            Ok(None) => return None,
            Err(RetryError::Store(e)) => {
                warn!(error = %e, "bayesian model read failed; degrading");
                *degraded = true;
                return None;
            }
            Err(e) => {
                debug!(error = %e, "bayesian tier unavailable");
                return None;
            }
        };

        let threshold = self.config.bayesian_threshold;
        let bucket = model.best_bucket(threshold)?;
        let confidence = (bucket.probability + bucket.lower_bound) / 2.0;
        if confidence < threshold {
            return None;
        }

        Some(RetryRecommendation {
            should_retry: true,
            delay_ms: bucket.midpoint_ms(),
            max_attempts: self.strategy.guardrails().max_attempts,
            confidence,
            estimated_success: bucket.probability,
            method: DecisionMethod::Bayesian,
            rationale: format!(
                "bayesian bucket [{}ms, {}) success probability {:.2} (ci [{:.2}, {:.2}], {} samples)",
                bucket.delay_min_ms,
                bucket
                    .delay_max_ms
                    .map(|m| format!("{m}ms"))
                    .unwrap_or_else(|| "inf".to_string()),
                bucket.probability,
                bucket.lower_bound,
                bucket.upper_bound,
                model.sample_count,
            ),
            policy_guardrails: vec![],
            next_evaluation_time: self.clock.now(),
        })
    }

    fn rules_tier(
        &self,
        guardrails: &Guardrails,
        features: &RetryFeatures,
    ) -> Option<RetryRecommendation> {
        if let Some(rec) = self.http_class_override(guardrails, features) {
            return Some(rec);
        }

        let policy = self
            .strategy
            .find_match(features.error_class.as_deref(), &features.job_type)?;

        let attempt = features.attempt_number.max(1);

        if policy.stop_on_validation
            && features
                .error_class
                .as_deref()
                .is_some_and(is_validation_error)
        {
            return Some(RetryRecommendation {
                should_retry: false,
                delay_ms: 0,
                max_attempts: policy.max_attempts,
                confidence: 0.95,
                estimated_success: 0.0,
                method: DecisionMethod::Rules,
                rationale: format!(
                    "Validation error '{}' matched policy '{}'; retrying cannot succeed",
                    features.error_class.as_deref().unwrap_or(""),
                    policy.name
                ),
                policy_guardrails: vec![],
                next_evaluation_time: self.clock.now(),
            });
        }

        let delay_ms = self.policy_delay(&policy, attempt, guardrails);
        let should_retry = attempt < policy.max_attempts;

        Some(RetryRecommendation {
            should_retry,
            delay_ms,
            max_attempts: policy.max_attempts,
            confidence: 0.8,
            estimated_success: 0.5,
            method: DecisionMethod::Rules,
            rationale: format!(
                "policy '{}' matched; backoff x{} from {}ms",
                policy.name, policy.backoff_multiplier, policy.base_delay_ms
            ),
            policy_guardrails: vec![],
            next_evaluation_time: self.clock.now(),
        })
    }

    /// Well-known HTTP-like error classes take precedence over policies.
    fn http_class_override(
        &self,
        guardrails: &Guardrails,
        features: &RetryFeatures,
    ) -> Option<RetryRecommendation> {
        let class = features
            .error_class
            .as_deref()
            .or(features.error_code.as_deref())?;

        let (should_retry, delay_ms, confidence, estimated, method, rationale) = match class {
            "429" => (
                true,
                60_000,
                0.9,
                0.7,
                DecisionMethod::RateLimitBackoff,
                "rate limited (429); waiting out the limit window",
            ),
            "503" => (
                true,
                5_000,
                0.9,
                0.6,
                DecisionMethod::ServiceUnavailableBackoff,
                "service unavailable (503); short backoff before retry",
            ),
            "400" => (
                false,
                0,
                0.95,
                0.0,
                DecisionMethod::NoRetryClientError,
                "client error (400) will not succeed on retry",
            ),
            "401" => (
                false,
                0,
                0.95,
                0.0,
                DecisionMethod::NoRetryAuthError,
                "authentication error (401) will not succeed on retry",
            ),
            _ => return None,
        };

        Some(RetryRecommendation {
            should_retry,
            delay_ms: delay_ms.min(guardrails.max_delay_ms),
            max_attempts: guardrails.max_attempts,
            confidence,
            estimated_success: estimated,
            method,
            rationale: rationale.to_string(),
            policy_guardrails: vec![],
            next_evaluation_time: self.clock.now(),
        })
    }

    fn default_tier(&self, features: &RetryFeatures, degraded: bool) -> RetryRecommendation {
        let attempt = features.attempt_number.max(1);
        let delay_ms = 1_000u64
            .saturating_mul(1u64 << attempt.min(20))
            .min(DEFAULT_DELAY_CAP_MS);

        let mut rationale =
            "no model or policy matched; default exponential backoff".to_string();
        if degraded {
            rationale.push_str(" (degraded: state store unavailable)");
        }

        RetryRecommendation {
            should_retry: attempt < self.config.default_max_attempts,
            delay_ms,
            max_attempts: self.config.default_max_attempts,
            confidence: 0.5,
            estimated_success: 0.5,
            method: DecisionMethod::Default,
            rationale,
            policy_guardrails: vec![],
            next_evaluation_time: self.clock.now(),
        }
    }

    // ---- helpers -----------------------------------------------------------

    fn policy_delay(&self, policy: &RetryPolicy, attempt: u32, guardrails: &Guardrails) -> u64 {
        let exp = policy.backoff_multiplier.powi((attempt - 1).min(30) as i32);
        let raw = (policy.base_delay_ms as f64 * exp).min(policy.max_delay_ms as f64);

        // Symmetric jitter: ±(jitter_percent / 2)%.
        let half = policy.jitter_percent / 200.0;
        let factor = if half > 0.0 {
            1.0 + self.rng.lock().gen_range(-half..=half)
        } else {
            1.0
        };

        (((raw * factor).max(0.0)) as u64)
            .min(policy.max_delay_ms)
            .min(guardrails.max_delay_ms)
    }

    /// Clamp invariants, stamp the next evaluation time, and publish.
    fn finish(
        &self,
        guardrails: &Guardrails,
        mut rec: RetryRecommendation,
    ) -> RetryRecommendation {
        rec.delay_ms = rec.delay_ms.min(guardrails.max_delay_ms);
        rec.confidence = rec.confidence.clamp(0.0, 1.0);
        rec.estimated_success = rec.estimated_success.clamp(0.0, 1.0);
        rec.next_evaluation_time = if rec.should_retry {
            self.clock.now() + ChronoDuration::milliseconds(rec.delay_ms as i64)
        } else {
            self.clock.now()
        };

        self.bus.publish(
            Event::new(
                EventKind::RecommendationGenerated,
                "retry recommendation generated",
                self.clock.now(),
            )
            .with("method", rec.method.to_string())
            .with("should_retry", rec.should_retry)
            .with("delay_ms", rec.delay_ms)
            .with("confidence", rec.confidence),
        );

        debug!(
            method = %rec.method,
            should_retry = rec.should_retry,
            delay_ms = rec.delay_ms,
            confidence = rec.confidence,
            "recommendation produced"
        );
        rec
    }

    // ---- management passthroughs -------------------------------------------

    pub fn strategy(&self) -> &StrategyStore {
        &self.strategy
    }

    pub async fn add_policy(
        &self,
        ctx: &TenantContext,
        policy: RetryPolicy,
    ) -> Result<(), RetryError> {
        self.strategy
            .add_policy(&KeySpace::for_tenant(ctx), policy)
            .await
    }

    pub async fn remove_policy(
        &self,
        ctx: &TenantContext,
        name: &str,
    ) -> Result<bool, RetryError> {
        self.strategy
            .remove_policy(&KeySpace::for_tenant(ctx), name)
            .await
    }

    pub async fn update_guardrails(
        &self,
        ctx: &TenantContext,
        guardrails: Guardrails,
    ) -> Result<(), RetryError> {
        self.strategy
            .update_guardrails(&KeySpace::for_tenant(ctx), guardrails)
            .await
    }

    pub async fn set_emergency_stop(
        &self,
        ctx: &TenantContext,
        on: bool,
    ) -> Result<(), RetryError> {
        self.strategy
            .set_emergency_stop(&KeySpace::for_tenant(ctx), on)
            .await
    }
}

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use common::clock::Clock;
use common::events::{Event, EventBus, EventKind};
use common::metrics::MetricsFeed;
use common::tenant::TenantContext;
use store::cache::TtlCache;
use store::keys::KeySpace;
use store::{StateStore, StateStoreExt};

use crate::error::CapacityError;
use crate::forecast::forecast;
use crate::queueing::{self, QueueModel};
use crate::types::{
    CapacityPlan, Forecast, ForecastModel, PlanRequest, PlannerState, QueueMetrics,
    ScalingAction, ScalingStep, SloTarget,
};

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    pub min_workers: u32,
    pub max_workers: u32,
    /// Largest per-step worker delta.
    pub max_step_size: u32,
    /// Minimum wall-clock spacing between scaling actions on one queue.
    pub cooldown: Duration,
    /// Headroom applied to the forecast peak before sizing.
    pub safety_margin: f64,
    /// Z-score above which current load is an anomaly.
    pub anomaly_threshold: f64,
    /// Multiplier over baseline above which current load is a spike.
    pub spike_threshold: f64,
    /// Plan freshness window (cache + valid_until).
    pub plan_ttl: Duration,
    /// How much history feeds the forecaster.
    pub forecast_window: Duration,
    /// Forecast horizon scanned for the peak.
    pub horizon: Duration,
    pub forecast_model: ForecastModel,
    pub queue_model: QueueModel,
    pub worker_cost_per_hour: f64,
    pub violation_cost_per_hour: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 100,
            max_step_size: 10,
            cooldown: Duration::from_secs(300),
            safety_margin: 0.2,
            anomaly_threshold: 3.0,
            spike_threshold: 2.5,
            plan_ttl: Duration::from_secs(600),
            forecast_window: Duration::from_secs(6 * 3600),
            horizon: Duration::from_secs(1800),
            forecast_model: ForecastModel::Ewma,
            queue_model: QueueModel::Mmc,
            worker_cost_per_hour: 0.5,
            violation_cost_per_hour: 50.0,
        }
    }
}

impl PlannerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("CAPACITY_MAX_WORKERS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.max_workers = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("CAPACITY_COOLDOWN_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.cooldown = Duration::from_secs(n);
            }
        }
        cfg
    }
}

/// The Capacity Planning Engine: forecast + queueing math + cooldown-aware
/// step decomposition.
///
/// Synchronous per call; plans are cached by logical-input fingerprint. A
/// store outage degrades to the in-memory cache or a freshly computed plan;
/// persistence failures are logged, never surfaced.
pub struct CapacityPlanner {
    store: Arc<dyn StateStore>,
    feed: Arc<dyn MetricsFeed>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: PlannerConfig,
    cache: TtlCache<CapacityPlan>,
    states: Mutex<HashMap<String, PlannerState>>,
}

impl CapacityPlanner {
    pub fn new(
        store: Arc<dyn StateStore>,
        feed: Arc<dyn MetricsFeed>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: PlannerConfig,
    ) -> Self {
        let cache = TtlCache::with_clock(128, config.plan_ttl, Arc::clone(&clock));
        Self {
            store,
            feed,
            bus,
            clock,
            config,
            cache,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn state(&self, queue: &str) -> Option<PlannerState> {
        self.states.lock().get(queue).cloned()
    }

    /// Generate (or serve from cache) a scaling plan for one queue.
    #[instrument(skip(self, ctx, request), target = "planner", fields(queue = %request.queue))]
    pub async fn plan(
        &self,
        ctx: &TenantContext,
        request: &PlanRequest,
    ) -> Result<CapacityPlan, CapacityError> {
        if request.queue.trim().is_empty() {
            return Err(CapacityError::InvalidRequest("queue must not be empty".into()));
        }
        if request.slo.p95_latency_secs <= 0.0 {
            return Err(CapacityError::InvalidRequest(
                "SLO latency must be positive".into(),
            ));
        }

        let ks = KeySpace::for_tenant(ctx);
        let fingerprint = self.fingerprint(request);
        let plan_key = ks.capacity_plan(&request.queue);
        let now = self.clock.now();

        if !request.force_regen {
            if let Some(cached) = self.cached_plan(&plan_key, fingerprint, now).await {
                debug!("serving cached capacity plan");
                return Ok(cached);
            }
        }

        let metrics = self
            .feed
            .latest(&request.queue)
            .await
            .map_err(|e| CapacityError::Feed(e.to_string()))?
            .ok_or_else(|| CapacityError::MetricsUnavailable(request.queue.clone()))?;

        if metrics.arrival_rate < 0.0 {
            return Err(CapacityError::InvalidRequest(
                "arrival rate must be non-negative".into(),
            ));
        }
        if metrics.service_time_mean <= 0.0 {
            return Err(CapacityError::InvalidRequest(
                "service time must be positive".into(),
            ));
        }

        let history = self
            .feed
            .history(&request.queue, self.config.forecast_window)
            .await
            .map_err(|e| CapacityError::Feed(e.to_string()))?;

        let mut warnings = Vec::new();
        let mut confidence_scale = 1.0_f64;

        let points = match forecast(&history, self.config.forecast_model, self.config.horizon, now)
        {
            Ok(points) => points,
            Err(e) => {
                // Plan from the current snapshot alone rather than failing.
                warnings.push(format!("forecast unavailable ({e}); using current load"));
                confidence_scale *= 0.5;
                vec![Forecast {
                    timestamp: now,
                    arrival_rate: metrics.arrival_rate,
                    confidence: 0.3,
                    lower: metrics.arrival_rate * 0.8,
                    upper: metrics.arrival_rate * 1.2,
                    model: self.config.forecast_model,
                }]
            }
        };

        if let Some(warning) = self.detect_anomaly(&metrics, &history) {
            warnings.push(warning);
            confidence_scale *= 0.7;
        }

        let peak = points
            .iter()
            .map(|f| f.arrival_rate)
            .fold(metrics.arrival_rate, f64::max);
        let sized_lambda = peak * (1.0 + self.config.safety_margin);
        let mu = metrics.service_rate();

        let capacity = queueing::required_capacity(
            self.config.queue_model,
            sized_lambda,
            mu,
            request.slo.p95_latency_secs,
            metrics.service_cv(),
        )?;

        let unclamped = capacity.servers;
        let target = unclamped.clamp(self.config.min_workers, self.config.max_workers);
        let slo_achievable = capacity.achievable && unclamped <= self.config.max_workers;
        if !slo_achievable {
            warnings.push(format!(
                "SLO requires {unclamped} workers but max_workers is {}",
                self.config.max_workers
            ));
        }

        let steps = self.decompose_steps(&request.queue, metrics.current_workers, target, now);

        let forecast_confidence = points
            .iter()
            .map(|f| f.confidence)
            .sum::<f64>()
            / points.len().max(1) as f64;
        let confidence = (forecast_confidence * capacity.assessment.confidence * confidence_scale)
            .clamp(0.1, 0.95);

        let cost_impact = self.estimate_cost(&metrics, target, &points, &request.slo);

        let plan = CapacityPlan {
            id: Uuid::new_v4(),
            queue_name: request.queue.clone(),
            generated_at: now,
            current_workers: metrics.current_workers,
            target_workers: target,
            steps,
            confidence,
            cost_impact,
            slo_achievable,
            rationale: format!(
                "peak forecast {:.2} jobs/s (+{:.0}% margin) needs {} workers under {:?} at p95 <= {:.2}s",
                peak,
                self.config.safety_margin * 100.0,
                target,
                self.config.queue_model,
                request.slo.p95_latency_secs
            ),
            warnings,
            valid_until: now + chrono::Duration::milliseconds(self.config.plan_ttl.as_millis() as i64),
            fingerprint,
            cache_hit: false,
        };

        // Track the baseline for future anomaly checks.
        self.states
            .lock()
            .entry(request.queue.clone())
            .or_insert_with(|| PlannerState {
                queue: request.queue.clone(),
                last_scaling: None,
                cooldown_until: None,
                baseline_arrival_rate: 0.0,
            })
            .baseline_arrival_rate = mean_rate(&history).unwrap_or(metrics.arrival_rate);

        // Persistence is best-effort: a store outage must not block planning.
        if let Err(e) = self
            .store
            .set_json(&plan_key, &plan, Some(self.config.plan_ttl))
            .await
        {
            warn!(error = %e, "failed to persist capacity plan");
        }
        self.cache.insert(plan_key, plan.clone());

        self.bus.publish(
            Event::new(EventKind::PlanGenerated, "capacity plan generated", now)
                .with("queue", &plan.queue_name)
                .with("current_workers", plan.current_workers)
                .with("target_workers", plan.target_workers)
                .with("steps", plan.steps.len())
                .with("slo_achievable", plan.slo_achievable),
        );

        info!(
            current = plan.current_workers,
            target = plan.target_workers,
            steps = plan.steps.len(),
            confidence = plan.confidence,
            "capacity plan generated"
        );
        Ok(plan)
    }

    /// Mark a plan as applied: records the scaling instant and arms the
    /// cooldown for the queue.
    pub async fn apply(
        &self,
        _ctx: &TenantContext,
        plan: &CapacityPlan,
    ) -> Result<(), CapacityError> {
        let now = self.clock.now();
        if plan.valid_until < now {
            return Err(CapacityError::InvalidRequest("plan has expired".into()));
        }

        let cooldown_until =
            now + chrono::Duration::milliseconds(self.config.cooldown.as_millis() as i64);
        {
            let mut states = self.states.lock();
            let state = states
                .entry(plan.queue_name.clone())
                .or_insert_with(|| PlannerState {
                    queue: plan.queue_name.clone(),
                    last_scaling: None,
                    cooldown_until: None,
                    baseline_arrival_rate: 0.0,
                });
            state.last_scaling = Some(now);
            state.cooldown_until = Some(cooldown_until);
        }

        self.bus.publish(
            Event::new(EventKind::PlanApplied, "capacity plan applied", now)
                .with("queue", &plan.queue_name)
                .with("target_workers", plan.target_workers),
        );
        Ok(())
    }

    async fn cached_plan(
        &self,
        plan_key: &str,
        fingerprint: u64,
        now: DateTime<Utc>,
    ) -> Option<CapacityPlan> {
        let fresh = |plan: &CapacityPlan| plan.fingerprint == fingerprint && plan.valid_until > now;

        if let Some(plan) = self.cache.get(plan_key) {
            if fresh(&plan) {
                let mut plan = plan;
                plan.cache_hit = true;
                return Some(plan);
            }
        }

        match self.store.get_json::<CapacityPlan>(plan_key).await {
            Ok(Some(plan)) if fresh(&plan) => {
                let mut plan = plan;
                plan.cache_hit = true;
                Some(plan)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "plan cache read failed; regenerating");
                None
            }
        }
    }

    fn detect_anomaly(&self, metrics: &QueueMetrics, history: &[QueueMetrics]) -> Option<String> {
        let mean = mean_rate(history)?;
        let n = history.len() as f64;
        let variance = history
            .iter()
            .map(|m| (m.arrival_rate - mean) * (m.arrival_rate - mean))
            .sum::<f64>()
            / n;
        let std = variance.sqrt();

        let z = if std > 1e-9 {
            (metrics.arrival_rate - mean) / std
        } else {
            0.0
        };

        let spiking = mean > 0.0 && metrics.arrival_rate > self.config.spike_threshold * mean;
        if z.abs() > self.config.anomaly_threshold || spiking {
            Some(format!(
                "arrival rate {:.2} is anomalous (z={:.1}, baseline {:.2})",
                metrics.arrival_rate, z, mean
            ))
        } else {
            None
        }
    }

    /// Split `current → target` into cooldown-spaced steps of bounded size.
    /// While the queue is still cooling down, the first step is pushed out to
    /// the end of the cooldown.
    fn decompose_steps(
        &self,
        queue: &str,
        current: u32,
        target: u32,
        now: DateTime<Utc>,
    ) -> Vec<ScalingStep> {
        let cooldown = chrono::Duration::milliseconds(self.config.cooldown.as_millis() as i64);
        let first_at = match self.states.lock().get(queue).and_then(|s| s.cooldown_until) {
            Some(until) if until > now => until,
            _ => now,
        };

        if current == target {
            return vec![ScalingStep {
                sequence: 0,
                scheduled_at: first_at,
                action: ScalingAction::NoChange,
                from: current,
                to: current,
                delta: 0,
                cooldown_until: first_at,
            }];
        }

        let step = self.config.max_step_size.max(1) as i64;
        let mut out = Vec::new();
        let mut from = current as i64;
        let goal = target as i64;
        let mut at = first_at;
        let mut sequence = 0u32;

        while from != goal {
            let delta = (goal - from).clamp(-step, step);
            let to = from + delta;
            out.push(ScalingStep {
                sequence,
                scheduled_at: at,
                action: if delta > 0 {
                    ScalingAction::ScaleUp
                } else {
                    ScalingAction::ScaleDown
                },
                from: from as u32,
                to: to as u32,
                delta: delta as i32,
                cooldown_until: at + cooldown,
            });
            from = to;
            at += cooldown;
            sequence += 1;
        }
        out
    }

    /// Cost delta per hour plus the projected SLO-violation cost over the
    /// forecast horizon at the proposed capacity.
    fn estimate_cost(
        &self,
        metrics: &QueueMetrics,
        target: u32,
        points: &[Forecast],
        slo: &SloTarget,
    ) -> f64 {
        let worker_delta =
            (target as f64 - metrics.current_workers as f64) * self.config.worker_cost_per_hour;

        let gran_hours = if points.len() >= 2 {
            ((points[1].timestamp - points[0].timestamp).num_seconds().max(1)) as f64 / 3600.0
        } else {
            300.0 / 3600.0
        };

        let mu = metrics.service_rate();
        let violation: f64 = points
            .iter()
            .filter(|f| {
                queueing::assess(self.config.queue_model, f.arrival_rate, mu, target, metrics.service_cv())
                    .map(|a| !a.stable || a.response_time_secs > slo.p95_latency_secs)
                    .unwrap_or(true)
            })
            .map(|_| self.config.violation_cost_per_hour * gran_hours)
            .sum();

        worker_delta + violation
    }

    fn fingerprint(&self, request: &PlanRequest) -> u64 {
        let mut h = DefaultHasher::new();
        request.queue.hash(&mut h);
        request.slo.p95_latency_secs.to_bits().hash(&mut h);
        request.slo.max_backlog.hash(&mut h);
        self.config.min_workers.hash(&mut h);
        self.config.max_workers.hash(&mut h);
        self.config.max_step_size.hash(&mut h);
        self.config.safety_margin.to_bits().hash(&mut h);
        format!("{:?}/{:?}", self.config.forecast_model, self.config.queue_model).hash(&mut h);
        h.finish()
    }
}

fn mean_rate(history: &[QueueMetrics]) -> Option<f64> {
    if history.is_empty() {
        return None;
    }
    Some(history.iter().map(|m| m.arrival_rate).sum::<f64>() / history.len() as f64)
}

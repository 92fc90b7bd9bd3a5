//! Capacity planner behavior against a scripted metrics feed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use common::clock::{Clock, ManualClock};
use common::events::{EventBus, EventKind};
use common::metrics::{Heartbeat, MetricsFeed, QueueMetrics};
use common::tenant::TenantContext;
use store::MemoryStore;

use capacity::planner::{CapacityPlanner, PlannerConfig};
use capacity::simulator::{SimulationConfig, TrafficPattern, simulate};
use capacity::types::{PlanRequest, ScalingAction, SloTarget};

const QUEUE: &str = "emails";

// -----------------------
// Scripted feed
// -----------------------

struct ScriptedFeed {
    latest: Mutex<Option<QueueMetrics>>,
    history: Mutex<Vec<QueueMetrics>>,
}

impl ScriptedFeed {
    fn new() -> Self {
        Self {
            latest: Mutex::new(None),
            history: Mutex::new(vec![]),
        }
    }

    fn set_latest(&self, m: QueueMetrics) {
        *self.latest.lock() = Some(m);
    }

    fn set_history(&self, h: Vec<QueueMetrics>) {
        *self.history.lock() = h;
    }
}

#[async_trait]
impl MetricsFeed for ScriptedFeed {
    async fn latest(&self, _queue: &str) -> Result<Option<QueueMetrics>> {
        Ok(self.latest.lock().clone())
    }

    async fn history(&self, _queue: &str, _window: Duration) -> Result<Vec<QueueMetrics>> {
        Ok(self.history.lock().clone())
    }

    async fn heartbeats(&self) -> Result<Vec<Heartbeat>> {
        Ok(vec![])
    }
}

fn mk_metrics(rate: f64, workers: u32, ts: DateTime<Utc>) -> QueueMetrics {
    QueueMetrics {
        timestamp: ts,
        queue: QUEUE.into(),
        arrival_rate: rate,
        // μ = 10 jobs/s per worker.
        service_time_mean: 0.1,
        service_time_std: 0.02,
        current_workers: workers,
        utilization: 0.5,
        backlog: 0,
        active_jobs: 0,
    }
}

struct Harness {
    planner: CapacityPlanner,
    feed: Arc<ScriptedFeed>,
    clock: ManualClock,
    bus: EventBus,
    ctx: TenantContext,
}

fn build_harness(config: PlannerConfig) -> Harness {
    let clock = ManualClock::new(1_700_000_000_000);
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(MemoryStore::with_clock(clock_arc.clone()));
    let feed = Arc::new(ScriptedFeed::new());
    let bus = EventBus::default();

    let planner = CapacityPlanner::new(store, feed.clone(), bus.clone(), clock_arc, config);
    Harness {
        planner,
        feed,
        clock,
        bus,
        ctx: TenantContext::unscoped(),
    }
}

fn steady_history(rate: f64, clock: &ManualClock, points: usize) -> Vec<QueueMetrics> {
    let now = clock.now();
    (0..points)
        .map(|i| {
            mk_metrics(
                rate,
                4,
                now - chrono::Duration::seconds(((points - i) * 300) as i64),
            )
        })
        .collect()
}

fn request(latency: f64) -> PlanRequest {
    PlanRequest {
        queue: QUEUE.into(),
        slo: SloTarget {
            p95_latency_secs: latency,
            max_backlog: 1_000,
        },
        force_regen: false,
    }
}

// -----------------------
// Plans
// -----------------------

#[tokio::test]
async fn plan_sizes_fleet_to_meet_latency_target() {
    let h = build_harness(PlannerConfig::default());
    h.feed.set_latest(mk_metrics(15.0, 1, h.clock.now()));
    h.feed.set_history(steady_history(15.0, &h.clock, 12));

    // λ=15, μ=10, 1s target: queueing math says 2-4 workers even with margin.
    let plan = h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();

    assert!(
        (2..=4).contains(&plan.target_workers),
        "target = {}",
        plan.target_workers
    );
    assert!(plan.slo_achievable);
    assert!(!plan.cache_hit);
    assert!(!plan.steps.is_empty());
    assert_eq!(plan.steps.last().unwrap().to, plan.target_workers);
    assert!((0.1..=0.95).contains(&plan.confidence));
}

#[tokio::test]
async fn plan_invariants_bounds_steps_and_cooldowns() {
    let config = PlannerConfig {
        min_workers: 2,
        max_workers: 50,
        max_step_size: 5,
        cooldown: Duration::from_secs(120),
        ..Default::default()
    };
    let cooldown = config.cooldown;
    let h = build_harness(config);

    h.feed.set_latest(mk_metrics(300.0, 2, h.clock.now()));
    h.feed.set_history(steady_history(300.0, &h.clock, 12));

    let plan = h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();

    assert!((2..=50).contains(&plan.target_workers));
    assert_eq!(plan.steps.last().unwrap().to, plan.target_workers);

    for step in &plan.steps {
        assert!(step.delta.unsigned_abs() <= 5, "step {:?}", step);
        assert!(step.cooldown_until >= step.scheduled_at);
    }
    for pair in plan.steps.windows(2) {
        assert!(pair[0].sequence < pair[1].sequence);
        let gap = pair[1].scheduled_at - pair[0].scheduled_at;
        assert!(
            gap >= chrono::Duration::milliseconds(cooldown.as_millis() as i64),
            "steps closer than cooldown: {gap}"
        );
    }

    // From 2 to 50 with step 5 → first step is 2 → 7.
    assert_eq!(plan.steps[0].from, 2);
    assert_eq!(plan.steps[0].to, 7);
    assert_eq!(plan.steps[0].action, ScalingAction::ScaleUp);
}

#[tokio::test]
async fn unreachable_slo_is_flagged_with_warning() {
    let config = PlannerConfig {
        max_workers: 3,
        ..Default::default()
    };
    let h = build_harness(config);
    h.feed.set_latest(mk_metrics(500.0, 1, h.clock.now()));
    h.feed.set_history(steady_history(500.0, &h.clock, 12));

    let plan = h.planner.plan(&h.ctx, &request(0.5)).await.unwrap();

    assert_eq!(plan.target_workers, 3, "clamped to max_workers");
    assert!(!plan.slo_achievable);
    assert!(
        plan.warnings.iter().any(|w| w.contains("max_workers")),
        "warnings: {:?}",
        plan.warnings
    );
}

#[tokio::test]
async fn cached_plan_is_served_until_inputs_change() {
    let h = build_harness(PlannerConfig::default());
    h.feed.set_latest(mk_metrics(15.0, 2, h.clock.now()));
    h.feed.set_history(steady_history(15.0, &h.clock, 12));

    let first = h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();
    let second = h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();
    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(second.id, first.id);

    // A different SLO is a different logical input: no cache hit.
    let third = h.planner.plan(&h.ctx, &request(2.0)).await.unwrap();
    assert!(!third.cache_hit);

    // force_regen bypasses a fresh cache entry.
    let forced = h
        .planner
        .plan(
            &h.ctx,
            &PlanRequest {
                force_regen: true,
                ..request(1.0)
            },
        )
        .await
        .unwrap();
    assert!(!forced.cache_hit);
}

#[tokio::test]
async fn anomalous_load_lowers_confidence_and_warns() {
    let h = build_harness(PlannerConfig::default());
    h.feed.set_history(steady_history(10.0, &h.clock, 24));

    h.feed.set_latest(mk_metrics(10.0, 4, h.clock.now()));
    let calm = h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();

    // 10x the baseline is a spike by any measure.
    h.feed.set_latest(mk_metrics(100.0, 4, h.clock.now()));
    let spiky = h
        .planner
        .plan(
            &h.ctx,
            &PlanRequest {
                force_regen: true,
                ..request(1.0)
            },
        )
        .await
        .unwrap();

    assert!(
        spiky.warnings.iter().any(|w| w.contains("anomalous")),
        "warnings: {:?}",
        spiky.warnings
    );
    assert!(spiky.confidence < calm.confidence);
}

#[tokio::test]
async fn insufficient_history_degrades_to_current_load() {
    let h = build_harness(PlannerConfig::default());
    h.feed.set_latest(mk_metrics(15.0, 2, h.clock.now()));
    h.feed.set_history(vec![]);

    let plan = h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();

    assert!(plan.target_workers >= 2);
    assert!(
        plan.warnings.iter().any(|w| w.contains("forecast unavailable")),
        "warnings: {:?}",
        plan.warnings
    );
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let h = build_harness(PlannerConfig::default());

    assert!(h
        .planner
        .plan(
            &h.ctx,
            &PlanRequest {
                queue: "".into(),
                slo: SloTarget {
                    p95_latency_secs: 1.0,
                    max_backlog: 10
                },
                force_regen: false,
            },
        )
        .await
        .is_err());

    assert!(h.planner.plan(&h.ctx, &request(0.0)).await.is_err());

    // No metrics for the queue at all.
    assert!(matches!(
        h.planner.plan(&h.ctx, &request(1.0)).await,
        Err(capacity::CapacityError::MetricsUnavailable(_))
    ));
}

#[tokio::test]
async fn applying_a_plan_arms_the_cooldown() {
    let config = PlannerConfig {
        cooldown: Duration::from_secs(600),
        ..Default::default()
    };
    let h = build_harness(config);
    h.feed.set_latest(mk_metrics(50.0, 1, h.clock.now()));
    h.feed.set_history(steady_history(50.0, &h.clock, 12));

    let plan = h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();
    h.planner.apply(&h.ctx, &plan).await.unwrap();

    let state = h.planner.state(QUEUE).unwrap();
    assert!(state.last_scaling.is_some());
    let cooldown_until = state.cooldown_until.unwrap();
    assert!(cooldown_until > h.clock.now());

    // A plan generated during the cooldown must not schedule before it ends.
    h.clock.advance_ms(60_000);
    h.feed.set_latest(mk_metrics(80.0, 1, h.clock.now()));
    let next = h
        .planner
        .plan(
            &h.ctx,
            &PlanRequest {
                force_regen: true,
                ..request(1.0)
            },
        )
        .await
        .unwrap();
    assert!(
        next.steps[0].scheduled_at >= cooldown_until,
        "first step {} before cooldown end {}",
        next.steps[0].scheduled_at,
        cooldown_until
    );
}

#[tokio::test]
async fn expired_plans_cannot_be_applied() {
    let h = build_harness(PlannerConfig::default());
    h.feed.set_latest(mk_metrics(15.0, 2, h.clock.now()));
    h.feed.set_history(steady_history(15.0, &h.clock, 12));

    let plan = h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();
    h.clock.advance_ms(2 * 600 * 1_000);

    assert!(h.planner.apply(&h.ctx, &plan).await.is_err());
}

#[tokio::test]
async fn plan_generated_event_is_published() {
    let h = build_harness(PlannerConfig::default());
    let mut rx = h.bus.subscribe();

    h.feed.set_latest(mk_metrics(15.0, 2, h.clock.now()));
    h.feed.set_history(steady_history(15.0, &h.clock, 12));
    h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();

    let ev = rx.recv().await.unwrap();
    assert_eq!(ev.kind, EventKind::PlanGenerated);
    assert_eq!(ev.data.get("queue").unwrap(), QUEUE);
}

// -----------------------
// Plan + simulator
// -----------------------

#[tokio::test]
async fn simulated_plan_outperforms_staying_put() {
    let h = build_harness(PlannerConfig {
        cooldown: Duration::from_secs(60),
        ..Default::default()
    });
    h.feed.set_latest(mk_metrics(50.0, 1, h.clock.now()));
    h.feed.set_history(steady_history(50.0, &h.clock, 12));

    let plan = h.planner.plan(&h.ctx, &request(1.0)).await.unwrap();

    let sim_config = SimulationConfig {
        duration: Duration::from_secs(3_600),
        granularity: Duration::from_secs(60),
        pattern: TrafficPattern::Constant { rate: 50.0 },
        service_rate: 10.0,
        initial_workers: plan.current_workers,
        seed: 17,
        slo: SloTarget {
            p95_latency_secs: 1.0,
            max_backlog: 1_000,
        },
        ..Default::default()
    };
    let cancel = CancellationToken::new();

    let with_plan = simulate(&plan, &sim_config, &cancel).unwrap();

    let mut frozen = plan.clone();
    frozen.steps.clear();
    let without_plan = simulate(&frozen, &sim_config, &cancel).unwrap();

    assert!(
        with_plan.summary.slo_achievement > without_plan.summary.slo_achievement,
        "plan {} vs frozen {}",
        with_plan.summary.slo_achievement,
        without_plan.summary.slo_achievement
    );
}

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::CapacityError;
use crate::queueing::{self, QueueModel};
use crate::types::{CapacityPlan, SloTarget};

/// Latency cap applied when the simulated system is saturated.
const SATURATED_LATENCY_SECS: f64 = 3_600.0;

/// Fixed daily traffic shape: overnight trough, morning ramp, lunchtime peak,
/// afternoon plateau, evening decline. Indexed by hour of day.
pub const DAILY_CURVE: [f64; 24] = [
    0.35, 0.30, 0.25, 0.25, 0.30, 0.40, 0.55, 0.75, 0.95, 1.10, 1.20, 1.15, 1.25, 1.20, 1.15,
    1.10, 1.05, 1.00, 0.90, 0.80, 0.70, 0.60, 0.50, 0.40,
];

/// Fixed weekly traffic shape, Monday first. Weekends run light.
pub const WEEKLY_CURVE: [f64; 7] = [1.05, 1.10, 1.10, 1.05, 1.00, 0.55, 0.45];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeShape {
    Instant,
    Linear,
    Exp,
    Bell,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Spike {
    pub start: Duration,
    pub duration: Duration,
    /// Additional jobs/second at full strength.
    pub magnitude: f64,
    pub shape: SpikeShape,
}

impl Spike {
    fn rate_at(&self, offset: Duration) -> f64 {
        if offset < self.start || self.duration.is_zero() {
            return 0.0;
        }
        let into = offset - self.start;
        if into >= self.duration {
            return 0.0;
        }
        let progress = into.as_secs_f64() / self.duration.as_secs_f64();

        match self.shape {
            SpikeShape::Instant => self.magnitude,
            SpikeShape::Linear => self.magnitude * (1.0 - progress),
            SpikeShape::Exp => self.magnitude * (-3.0 * progress).exp(),
            SpikeShape::Bell => {
                let d = progress - 0.5;
                self.magnitude * (-(d * d) / 0.045).exp()
            }
        }
    }
}

/// Synthetic traffic patterns for what-if plan replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TrafficPattern {
    Constant { rate: f64 },
    Sinusoidal { base: f64, amplitude: f64, period: Duration },
    LinearTrend { start: f64, slope_per_hour: f64 },
    Daily { base: f64 },
    Weekly { base: f64 },
    Spiky { base: f64, spikes: Vec<Spike> },
}

impl TrafficPattern {
    /// Deterministic (noise-free) rate at an offset from simulation start.
    pub fn rate_at(&self, offset: Duration) -> f64 {
        let secs = offset.as_secs_f64();
        let rate = match self {
            TrafficPattern::Constant { rate } => *rate,
            TrafficPattern::Sinusoidal { base, amplitude, period } => {
                let period = period.as_secs_f64().max(1.0);
                base + amplitude * (secs / period * std::f64::consts::TAU).sin()
            }
            TrafficPattern::LinearTrend { start, slope_per_hour } => {
                start + slope_per_hour * secs / 3_600.0
            }
            TrafficPattern::Daily { base } => {
                base * DAILY_CURVE[(offset.as_secs() / 3_600 % 24) as usize]
            }
            TrafficPattern::Weekly { base } => {
                base * WEEKLY_CURVE[(offset.as_secs() / 86_400 % 7) as usize]
            }
            TrafficPattern::Spiky { base, spikes } => {
                base + spikes.iter().map(|s| s.rate_at(offset)).sum::<f64>()
            }
        };
        rate.max(0.0)
    }
}

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub duration: Duration,
    pub granularity: Duration,
    pub pattern: TrafficPattern,
    /// Coefficient of variation of the multiplicative Gaussian noise.
    pub noise_cv: f64,
    pub seed: u64,
    /// μ per worker, jobs/second.
    pub service_rate: f64,
    pub initial_workers: u32,
    pub initial_backlog: f64,
    pub slo: SloTarget,
    pub worker_cost_per_hour: f64,
    pub violation_cost_per_hour: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(3_600),
            granularity: Duration::from_secs(60),
            pattern: TrafficPattern::Constant { rate: 10.0 },
            noise_cv: 0.0,
            seed: 0,
            service_rate: 1.0,
            initial_workers: 10,
            initial_backlog: 0.0,
            slo: SloTarget {
                p95_latency_secs: 5.0,
                max_backlog: 1_000,
            },
            worker_cost_per_hour: 0.5,
            violation_cost_per_hour: 50.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationTick {
    pub offset_secs: u64,
    pub arrival_rate: f64,
    pub arrivals: u64,
    pub workers: u32,
    pub backlog: f64,
    pub latency_secs: f64,
    pub utilization: f64,
    pub cost: f64,
    pub violating: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

/// Coalesced run of consecutive violating ticks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViolationPeriod {
    pub start_offset_secs: u64,
    pub end_offset_secs: u64,
    pub severity: Severity,
    pub peak_latency_secs: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub ticks: usize,
    pub avg_backlog: f64,
    pub max_backlog: f64,
    pub p95_latency_secs: f64,
    /// `1 - violations / ticks`.
    pub slo_achievement: f64,
    pub total_cost: f64,
    /// `slo_achievement / total_cost × 1000`.
    pub efficiency_score: f64,
    pub violations: Vec<ViolationPeriod>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationResult {
    pub timeline: Vec<SimulationTick>,
    pub summary: SimulationSummary,
}

/// Service efficiency as a function of utilization: full throughput until
/// ρ = 0.8, degrading linearly under contention, floored at 0.5.
fn efficiency(rho: f64) -> f64 {
    if rho <= 0.8 {
        1.0
    } else {
        (1.0 - 1.5 * (rho - 0.8)).max(0.5)
    }
}

/// Poisson sampling: Knuth's product method for small λ, Gaussian
/// approximation for λ ≥ 30.
fn sample_poisson(rng: &mut StdRng, lambda: f64) -> u64 {
    if lambda <= 0.0 {
        return 0;
    }
    if lambda < 30.0 {
        let l = (-lambda).exp();
        let mut k = 0u64;
        let mut p = 1.0_f64;
        loop {
            k += 1;
            p *= rng.r#gen::<f64>();
            if p <= l {
                return k - 1;
            }
        }
    }
    let z = sample_standard_normal(rng);
    (lambda + lambda.sqrt() * z).round().max(0.0) as u64
}

/// Box-Muller, so the only entropy source is the injected seeded RNG.
fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.r#gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Replay a plan against a synthetic traffic pattern.
///
/// Deterministic given the config seed. The cancellation token is checked on
/// every tick; cancellation returns without a result.
#[instrument(skip_all, target = "simulator", fields(queue = %plan.queue_name))]
pub fn simulate(
    plan: &CapacityPlan,
    config: &SimulationConfig,
    cancel: &CancellationToken,
) -> Result<SimulationResult, CapacityError> {
    if config.granularity.is_zero() {
        return Err(CapacityError::InvalidRequest(
            "granularity must be positive".into(),
        ));
    }
    if config.service_rate <= 0.0 {
        return Err(CapacityError::InvalidRequest(
            "service rate must be positive".into(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let dt = config.granularity.as_secs_f64();
    let ticks = (config.duration.as_secs() / config.granularity.as_secs().max(1)) as usize;

    let mut workers = config.initial_workers.max(1);
    let mut backlog = config.initial_backlog.max(0.0);
    let mut timeline = Vec::with_capacity(ticks);
    let mut next_step = 0usize;
    let mut step_gate = plan.generated_at;

    let mu = config.service_rate;

    for tick in 0..ticks {
        if cancel.is_cancelled() {
            return Err(CapacityError::Cancelled);
        }

        let offset = Duration::from_secs(tick as u64 * config.granularity.as_secs());
        let sim_now = plan.generated_at + chrono::Duration::seconds(offset.as_secs() as i64);

        // Apply due scaling steps, honoring each step's cooldown gate.
        while let Some(step) = plan.steps.get(next_step) {
            if step.scheduled_at <= sim_now && step_gate <= sim_now {
                workers = step.to.max(1);
                step_gate = step.cooldown_until;
                next_step += 1;
            } else {
                break;
            }
        }

        let base_rate = config.pattern.rate_at(offset);
        let rate = if config.noise_cv > 0.0 {
            (base_rate * (1.0 + config.noise_cv * sample_standard_normal(&mut rng))).max(0.0)
        } else {
            base_rate
        };

        let arrivals = sample_poisson(&mut rng, rate * dt);

        let rho = rate / (workers as f64 * mu);
        let capacity_jobs = workers as f64 * mu * efficiency(rho) * dt;
        backlog = (backlog + arrivals as f64 - capacity_jobs).max(0.0);

        let latency_secs = match queueing::assess(QueueModel::Mmc, rate, mu, workers, 0.0) {
            Ok(a) if a.stable => a.response_time_secs.min(SATURATED_LATENCY_SECS),
            _ => SATURATED_LATENCY_SECS,
        };

        let violating =
            latency_secs > config.slo.p95_latency_secs || backlog > config.slo.max_backlog as f64;

        let mut cost = workers as f64 * config.worker_cost_per_hour * dt / 3_600.0;
        if violating {
            cost += config.violation_cost_per_hour * dt / 3_600.0;
        }

        timeline.push(SimulationTick {
            offset_secs: offset.as_secs(),
            arrival_rate: rate,
            arrivals,
            workers,
            backlog,
            latency_secs,
            utilization: rho,
            cost,
            violating,
        });
    }

    let summary = summarize(&timeline, &config.slo);
    debug!(
        ticks = summary.ticks,
        slo_achievement = summary.slo_achievement,
        total_cost = summary.total_cost,
        "simulation complete"
    );
    Ok(SimulationResult { timeline, summary })
}

fn summarize(timeline: &[SimulationTick], slo: &SloTarget) -> SimulationSummary {
    let ticks = timeline.len();
    if ticks == 0 {
        return SimulationSummary {
            ticks: 0,
            avg_backlog: 0.0,
            max_backlog: 0.0,
            p95_latency_secs: 0.0,
            slo_achievement: 1.0,
            total_cost: 0.0,
            efficiency_score: 0.0,
            violations: vec![],
        };
    }

    let avg_backlog = timeline.iter().map(|t| t.backlog).sum::<f64>() / ticks as f64;
    let max_backlog = timeline.iter().map(|t| t.backlog).fold(0.0, f64::max);

    let mut latencies: Vec<f64> = timeline.iter().map(|t| t.latency_secs).collect();
    latencies.sort_by(f64::total_cmp);
    let p95_idx = ((ticks as f64 * 0.95).ceil() as usize).clamp(1, ticks) - 1;
    let p95_latency_secs = latencies[p95_idx];

    let violations_count = timeline.iter().filter(|t| t.violating).count();
    let slo_achievement = 1.0 - violations_count as f64 / ticks as f64;
    let total_cost: f64 = timeline.iter().map(|t| t.cost).sum();
    let efficiency_score = if total_cost > 0.0 {
        slo_achievement / total_cost * 1_000.0
    } else {
        0.0
    };

    SimulationSummary {
        ticks,
        avg_backlog,
        max_backlog,
        p95_latency_secs,
        slo_achievement,
        total_cost,
        efficiency_score,
        violations: coalesce_violations(timeline, slo),
    }
}

/// Merge consecutive violating ticks into tagged periods. Severity follows
/// the worst overshoot seen in the period (latency or backlog ratio):
/// under 2x is minor, under 5x major, beyond that critical.
fn coalesce_violations(timeline: &[SimulationTick], slo: &SloTarget) -> Vec<ViolationPeriod> {
    let mut out: Vec<ViolationPeriod> = Vec::new();
    let mut open: Option<(u64, u64, f64, f64)> = None; // (start, end, peak_ratio, peak_latency)

    for t in timeline {
        if t.violating {
            let latency_ratio = t.latency_secs / slo.p95_latency_secs.max(1e-9);
            let backlog_ratio = t.backlog / (slo.max_backlog as f64).max(1.0);
            let ratio = latency_ratio.max(backlog_ratio);

            open = Some(match open {
                Some((start, _, peak_ratio, peak_latency)) => (
                    start,
                    t.offset_secs,
                    peak_ratio.max(ratio),
                    peak_latency.max(t.latency_secs),
                ),
                None => (t.offset_secs, t.offset_secs, ratio, t.latency_secs),
            });
        } else if let Some((start, end, peak_ratio, peak_latency)) = open.take() {
            out.push(close_period(start, end, peak_ratio, peak_latency));
        }
    }
    if let Some((start, end, peak_ratio, peak_latency)) = open {
        out.push(close_period(start, end, peak_ratio, peak_latency));
    }
    out
}

fn close_period(start: u64, end: u64, peak_ratio: f64, peak_latency: f64) -> ViolationPeriod {
    let severity = if peak_ratio < 2.0 {
        Severity::Minor
    } else if peak_ratio < 5.0 {
        Severity::Major
    } else {
        Severity::Critical
    };
    ViolationPeriod {
        start_offset_secs: start,
        end_offset_secs: end,
        severity,
        peak_latency_secs: peak_latency,
    }
}

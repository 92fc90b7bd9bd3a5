use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use common::metrics::QueueMetrics;

/// Forecasting model selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastModel {
    Ewma,
    Linear,
    HoltWinters,
    Seasonal,
}

/// One forecast point. Sequences are time-ordered with fixed granularity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Forecast {
    pub timestamp: DateTime<Utc>,
    /// Predicted λ, always >= 0.
    pub arrival_rate: f64,
    pub confidence: f64,
    pub lower: f64,
    pub upper: f64,
    pub model: ForecastModel,
}

/// Latency/backlog targets a plan must meet.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SloTarget {
    pub p95_latency_secs: f64,
    pub max_backlog: u64,
}

#[derive(Clone, Debug)]
pub struct PlanRequest {
    pub queue: String,
    pub slo: SloTarget,
    /// Skip the plan cache even if a fresh plan exists.
    pub force_regen: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoChange,
}

/// One bounded move of the fleet size.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScalingStep {
    pub sequence: u32,
    pub scheduled_at: DateTime<Utc>,
    pub action: ScalingAction,
    pub from: u32,
    pub to: u32,
    pub delta: i32,
    pub cooldown_until: DateTime<Utc>,
}

/// A bounded, cooldown-respecting, multi-step scaling plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapacityPlan {
    pub id: Uuid,
    pub queue_name: String,
    pub generated_at: DateTime<Utc>,
    pub current_workers: u32,
    pub target_workers: u32,
    pub steps: Vec<ScalingStep>,
    pub confidence: f64,
    /// Projected cost delta per hour plus expected violation cost.
    pub cost_impact: f64,
    pub slo_achievable: bool,
    pub rationale: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub valid_until: DateTime<Utc>,
    /// Hash of the logical inputs the plan was computed from; used to decide
    /// whether a cached plan still answers the same question.
    pub fingerprint: u64,
    /// True when served from cache rather than regenerated.
    #[serde(default)]
    pub cache_hit: bool,
}

/// Per-queue planner bookkeeping for cooldown decisions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannerState {
    pub queue: String,
    pub last_scaling: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub baseline_arrival_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_action_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ScalingAction::ScaleUp).unwrap(),
            "\"scale_up\""
        );
        assert_eq!(
            serde_json::to_string(&ForecastModel::HoltWinters).unwrap(),
            "\"holt_winters\""
        );
    }

    #[test]
    fn plan_roundtrips_through_json() {
        let now = Utc::now();
        let plan = CapacityPlan {
            id: Uuid::new_v4(),
            queue_name: "emails".into(),
            generated_at: now,
            current_workers: 4,
            target_workers: 8,
            steps: vec![ScalingStep {
                sequence: 0,
                scheduled_at: now,
                action: ScalingAction::ScaleUp,
                from: 4,
                to: 8,
                delta: 4,
                cooldown_until: now,
            }],
            confidence: 0.8,
            cost_impact: 2.0,
            slo_achievable: true,
            rationale: "peak forecast".into(),
            warnings: vec![],
            valid_until: now,
            fingerprint: 42,
            cache_hit: false,
        };

        let back: CapacityPlan =
            serde_json::from_str(&serde_json::to_string(&plan).unwrap()).unwrap();
        assert_eq!(back.target_workers, 8);
        assert_eq!(back.steps.len(), 1);
        assert_eq!(back.fingerprint, 42);
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::FleetError;
use crate::registry::FleetSummary;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetAction {
    Pause,
    Resume,
    Drain,
    Stop,
    Restart,
}

impl fmt::Display for FleetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FleetAction::Pause => "pause",
            FleetAction::Resume => "resume",
            FleetAction::Drain => "drain",
            FleetAction::Stop => "stop",
            FleetAction::Restart => "restart",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SafetyConfig {
    /// Minimum healthy workers that must remain after a drain/stop.
    pub min_healthy_workers: usize,
    /// Largest share of the fleet (percent) one drain/stop may touch.
    pub max_drain_percentage: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_healthy_workers: 1,
            max_drain_percentage: 50.0,
        }
    }
}

/// Gate a fleet action against the current fleet shape.
///
/// Stateless; the controller calls this before mutating anything.
pub fn validate(
    config: &SafetyConfig,
    action: FleetAction,
    subjects: usize,
    force: bool,
    summary: &FleetSummary,
) -> Result<(), FleetError> {
    if subjects == 0 {
        return Err(FleetError::InvalidRequest("no workers selected".into()));
    }

    match action {
        FleetAction::Drain | FleetAction::Stop => {
            let healthy_after = summary.healthy().saturating_sub(subjects);
            if healthy_after < config.min_healthy_workers {
                return Err(FleetError::SafetyViolation(format!(
                    "{action} would leave {healthy_after} healthy workers (minimum {})",
                    config.min_healthy_workers
                )));
            }

            if summary.total > 0 {
                let share = subjects as f64 / summary.total as f64 * 100.0;
                if share > config.max_drain_percentage {
                    return Err(FleetError::SafetyViolation(format!(
                        "{action} touches {share:.0}% of the fleet (limit {:.0}%)",
                        config.max_drain_percentage
                    )));
                }
            }

            if subjects >= summary.running && summary.running > 0 && !force {
                return Err(FleetError::SafetyViolation(format!(
                    "{action} of every running worker requires force"
                )));
            }
        }
        FleetAction::Pause => {
            if subjects >= summary.running && summary.running > 0 && !force {
                return Err(FleetError::SafetyViolation(
                    "pausing every running worker requires force".into(),
                ));
            }
        }
        FleetAction::Resume | FleetAction::Restart => {}
    }

    Ok(())
}

/// Whether the action is large enough to demand typed confirmation.
pub fn requires_confirmation(
    action: FleetAction,
    subjects: usize,
    summary: &FleetSummary,
) -> bool {
    let share = if summary.total > 0 {
        subjects as f64 / summary.total as f64 * 100.0
    } else {
        0.0
    };

    match action {
        FleetAction::Drain | FleetAction::Stop => share >= 25.0 || subjects >= 5,
        FleetAction::Pause => share >= 50.0 || subjects >= 10,
        FleetAction::Restart => subjects >= 3,
        FleetAction::Resume => false,
    }
}

/// Case-insensitive, whitespace-trimmed match against the confirmation word.
pub fn validate_confirmation(input: Option<&str>) -> Result<(), FleetError> {
    match input {
        Some(text) if text.trim().eq_ignore_ascii_case("CONFIRM") => Ok(()),
        Some(_) => Err(FleetError::ConfirmationRequired(
            "confirmation text must be CONFIRM".into(),
        )),
        None => Err(FleetError::ConfirmationRequired(
            "type CONFIRM to proceed".into(),
        )),
    }
}

/// Advisory fleet-health check: logs when the fleet looks too sick for the
/// requested blast radius, but never blocks.
pub fn check_fleet_health(summary: &FleetSummary, subjects: usize) {
    let sick = summary.offline + summary.unknown;
    if sick > 0 && sick >= subjects {
        warn!(
            offline = summary.offline,
            unknown = summary.unknown,
            subjects,
            "fleet health is degraded; proceeding anyway"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(total: usize, running: usize) -> FleetSummary {
        FleetSummary {
            total,
            running,
            ..Default::default()
        }
    }

    #[test]
    fn drain_preserves_minimum_healthy_floor() {
        let config = SafetyConfig {
            min_healthy_workers: 2,
            max_drain_percentage: 90.0,
        };
        let s = summary(10, 10);

        assert!(validate(&config, FleetAction::Drain, 8, false, &s).is_ok());
        assert!(matches!(
            validate(&config, FleetAction::Drain, 9, false, &s),
            Err(FleetError::SafetyViolation(_))
        ));
    }

    #[test]
    fn drain_percentage_cap_applies() {
        let config = SafetyConfig {
            min_healthy_workers: 0,
            max_drain_percentage: 50.0,
        };
        let s = summary(10, 10);

        assert!(validate(&config, FleetAction::Drain, 5, false, &s).is_ok());
        assert!(validate(&config, FleetAction::Drain, 6, false, &s).is_err());
    }

    #[test]
    fn stopping_everything_requires_force() {
        let config = SafetyConfig {
            min_healthy_workers: 0,
            max_drain_percentage: 100.0,
        };
        let s = summary(4, 4);

        assert!(validate(&config, FleetAction::Stop, 4, false, &s).is_err());
        assert!(validate(&config, FleetAction::Stop, 4, true, &s).is_ok());
    }

    #[test]
    fn pausing_everything_requires_force() {
        let config = SafetyConfig::default();
        let s = summary(4, 4);

        assert!(validate(&config, FleetAction::Pause, 4, false, &s).is_err());
        assert!(validate(&config, FleetAction::Pause, 4, true, &s).is_ok());
        assert!(validate(&config, FleetAction::Pause, 2, false, &s).is_ok());
    }

    #[test]
    fn resume_is_never_gated() {
        let config = SafetyConfig::default();
        let s = summary(2, 0);
        assert!(validate(&config, FleetAction::Resume, 2, false, &s).is_ok());
    }

    #[test]
    fn empty_selection_is_invalid() {
        let config = SafetyConfig::default();
        assert!(validate(&config, FleetAction::Pause, 0, false, &summary(4, 4)).is_err());
    }

    #[test]
    fn confirmation_thresholds_match_action_class() {
        let s = summary(100, 100);

        // Drain/stop: >= 25% or >= 5 workers.
        assert!(requires_confirmation(FleetAction::Drain, 25, &s));
        assert!(requires_confirmation(FleetAction::Stop, 5, &s));
        assert!(!requires_confirmation(FleetAction::Drain, 4, &s));

        // Pause: >= 50% or >= 10 workers.
        assert!(requires_confirmation(FleetAction::Pause, 50, &s));
        assert!(requires_confirmation(FleetAction::Pause, 10, &s));
        assert!(!requires_confirmation(FleetAction::Pause, 9, &s));

        // Restart: >= 3 workers.
        assert!(requires_confirmation(FleetAction::Restart, 3, &s));
        assert!(!requires_confirmation(FleetAction::Restart, 2, &s));

        assert!(!requires_confirmation(FleetAction::Resume, 100, &s));
    }

    #[test]
    fn confirmation_text_is_trimmed_and_case_insensitive() {
        assert!(validate_confirmation(Some("CONFIRM")).is_ok());
        assert!(validate_confirmation(Some("  confirm  ")).is_ok());
        assert!(validate_confirmation(Some("Confirm")).is_ok());
        assert!(validate_confirmation(Some("yes")).is_err());
        assert!(validate_confirmation(None).is_err());
    }
}

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable fact of one job execution attempt.
///
/// Attempts are the ground truth for the Bayesian engine and for supervised
/// training; they are sampled at a configurable rate, retained for the
/// configured window, then reaped by TTL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub job_id: String,
    pub job_type: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// 1-based attempt counter.
    pub attempt_number: u32,
    /// Delay applied before this attempt.
    pub delay_ms: u64,
    pub success: bool,
    pub payload_size: u64,
    /// Hour of day in [0, 23].
    pub time_of_day: u8,
    pub worker_version: String,
    #[serde(default)]
    pub health_signals: HashMap<String, f64>,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Per-(queue, error-class) counters derived from sampled attempts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl AggregatedStats {
    pub fn success_rate(&self) -> f64 {
        let retries = self.successful_retries + self.failed_retries;
        if retries == 0 {
            0.0
        } else {
            self.successful_retries as f64 / retries as f64
        }
    }
}

/// Input to the decision cascade: a failing attempt, described.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryFeatures {
    pub job_id: String,
    pub job_type: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub attempt_number: u32,
    pub payload_size: u64,
    pub time_of_day: u8,
    pub worker_version: String,
    #[serde(default)]
    pub health_signals: HashMap<String, f64>,
}

impl RetryFeatures {
    /// Minimal feature set for tests and simple callers.
    pub fn basic(job_type: &str, error_class: Option<&str>, attempt_number: u32) -> Self {
        Self {
            job_id: String::new(),
            job_type: job_type.to_string(),
            queue: String::new(),
            error_class: error_class.map(str::to_string),
            error_code: None,
            attempt_number,
            payload_size: 0,
            time_of_day: 0,
            worker_version: String::new(),
            health_signals: HashMap::new(),
        }
    }
}

impl From<&AttemptRecord> for RetryFeatures {
    fn from(rec: &AttemptRecord) -> Self {
        Self {
            job_id: rec.job_id.clone(),
            job_type: rec.job_type.clone(),
            queue: rec.queue.clone(),
            error_class: rec.error_class.clone(),
            error_code: rec.error_code.clone(),
            attempt_number: rec.attempt_number,
            payload_size: rec.payload_size,
            time_of_day: rec.time_of_day,
            worker_version: rec.worker_version.clone(),
            health_signals: rec.health_signals.clone(),
        }
    }
}

/// Which tier produced a recommendation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    Guardrails,
    Supervised,
    Bayesian,
    Rules,
    Default,
    RateLimitBackoff,
    ServiceUnavailableBackoff,
    NoRetryClientError,
    NoRetryAuthError,
}

impl fmt::Display for DecisionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionMethod::Guardrails => "guardrails",
            DecisionMethod::Supervised => "supervised",
            DecisionMethod::Bayesian => "bayesian",
            DecisionMethod::Rules => "rules",
            DecisionMethod::Default => "default",
            DecisionMethod::RateLimitBackoff => "rate_limit_backoff",
            DecisionMethod::ServiceUnavailableBackoff => "service_unavailable_backoff",
            DecisionMethod::NoRetryClientError => "no_retry_client_error",
            DecisionMethod::NoRetryAuthError => "no_retry_auth_error",
        };
        f.write_str(s)
    }
}

/// Output of the decision cascade.
///
/// Always produced: business failures collapse into the default tier rather
/// than surfacing as errors. `method` + `rationale` let a caller determine
/// which tier decided and why.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryRecommendation {
    pub should_retry: bool,
    pub delay_ms: u64,
    pub max_attempts: u32,
    /// In [0, 1].
    pub confidence: f64,
    /// In [0, 1].
    pub estimated_success: f64,
    pub method: DecisionMethod,
    pub rationale: String,
    /// Names of the guardrails that fired, if any.
    #[serde(default)]
    pub policy_guardrails: Vec<String>,
    pub next_evaluation_time: DateTime<Utc>,
}

/// Hard limits that override any tier output.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Guardrails {
    pub max_attempts: u32,
    pub max_delay_ms: u64,
    pub emergency_stop: bool,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_delay_ms: 300_000,
            emergency_stop: false,
        }
    }
}

/// One step of a previewed retry schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreviewStep {
    pub attempt: u32,
    pub delay_ms: u64,
    pub cumulative_delay_ms: u64,
    pub should_retry: bool,
    pub method: DecisionMethod,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_serializes_to_wire_strings() {
        for (method, expect) in [
            (DecisionMethod::Guardrails, "\"guardrails\""),
            (DecisionMethod::RateLimitBackoff, "\"rate_limit_backoff\""),
            (DecisionMethod::NoRetryAuthError, "\"no_retry_auth_error\""),
        ] {
            assert_eq!(serde_json::to_string(&method).unwrap(), expect);
        }
        assert_eq!(DecisionMethod::ServiceUnavailableBackoff.to_string(), "service_unavailable_backoff");
    }

    #[test]
    fn success_rate_counts_retries_only() {
        let stats = AggregatedStats {
            total_attempts: 10,
            successful_retries: 3,
            failed_retries: 1,
            last_updated: None,
        };
        assert!((stats.success_rate() - 0.75).abs() < 1e-9);

        let empty = AggregatedStats::default();
        assert_eq!(empty.success_rate(), 0.0);
    }

    #[test]
    fn attempt_record_roundtrips_through_json() {
        let rec = AttemptRecord {
            job_id: "j1".into(),
            job_type: "email".into(),
            queue: "q".into(),
            tenant: None,
            error_class: Some("timeout".into()),
            error_code: Some("504".into()),
            attempt_number: 2,
            delay_ms: 4_000,
            success: true,
            payload_size: 128,
            time_of_day: 14,
            worker_version: "1.2.3".into(),
            health_signals: HashMap::from([("cpu".into(), 0.7)]),
            processing_time_ms: 250,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&rec).unwrap();
        let back: AttemptRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, rec.job_id);
        assert_eq!(back.attempt_number, 2);
        assert_eq!(back.health_signals.get("cpu"), Some(&0.7));
    }
}

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sample of per-queue arrival/service behavior.
///
/// `arrival_rate` and `service_time_*` are in jobs/second and seconds; the
/// queueing calculator consumes them directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub timestamp: DateTime<Utc>,
    pub queue: String,
    /// λ, jobs per second.
    pub arrival_rate: f64,
    /// Mean service time per job, seconds.
    pub service_time_mean: f64,
    /// Standard deviation of service time, seconds.
    pub service_time_std: f64,
    pub current_workers: u32,
    /// ρ as reported by the feed; advisory only, engines recompute.
    pub utilization: f64,
    pub backlog: u64,
    pub active_jobs: u64,
}

impl QueueMetrics {
    /// Service rate μ per worker (jobs/second). Zero mean service time yields
    /// zero, which downstream math treats as invalid input.
    pub fn service_rate(&self) -> f64 {
        if self.service_time_mean > 0.0 {
            1.0 / self.service_time_mean
        } else {
            0.0
        }
    }

    /// Coefficient of variation of service time.
    pub fn service_cv(&self) -> f64 {
        if self.service_time_mean > 0.0 {
            self.service_time_std / self.service_time_mean
        } else {
            0.0
        }
    }
}

/// Worker liveness sample surfaced by the metrics feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub current_job: Option<String>,
}

/// Read-only rolling-statistics source.
///
/// The feed may be backed by the state store or a separate system; the core
/// does not care and never writes through this interface.
#[async_trait]
pub trait MetricsFeed: Send + Sync {
    async fn latest(&self, queue: &str) -> Result<Option<QueueMetrics>>;

    async fn history(&self, queue: &str, window: Duration) -> Result<Vec<QueueMetrics>>;

    async fn heartbeats(&self) -> Result<Vec<Heartbeat>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_rate_inverts_mean() {
        let m = QueueMetrics {
            timestamp: Utc::now(),
            queue: "emails".into(),
            arrival_rate: 10.0,
            service_time_mean: 0.25,
            service_time_std: 0.05,
            current_workers: 4,
            utilization: 0.6,
            backlog: 0,
            active_jobs: 3,
        };
        assert!((m.service_rate() - 4.0).abs() < 1e-9);
        assert!((m.service_cv() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn zero_mean_service_time_is_inert() {
        let m = QueueMetrics {
            timestamp: Utc::now(),
            queue: "emails".into(),
            arrival_rate: 10.0,
            service_time_mean: 0.0,
            service_time_std: 0.0,
            current_workers: 1,
            utilization: 0.0,
            backlog: 0,
            active_jobs: 0,
        };
        assert_eq!(m.service_rate(), 0.0);
        assert_eq!(m.service_cv(), 0.0);
    }
}

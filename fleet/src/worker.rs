use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Paused,
    Draining,
    Stopped,
    Offline,
    Unknown,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
            WorkerState::Offline => "offline",
            WorkerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Allowed state transitions:
///
/// ```text
/// running ⇄ paused
/// running → draining → stopped
/// running | paused → stopped        (controller stop)
/// any but stopped → offline         (heartbeat expiry)
/// offline → running                 (fresh heartbeat)
/// any     → unknown                 (corrupted read)
/// unknown → running
/// ```
///
/// `stopped` is terminal for transitions: the controller owns it, and a
/// worker that restarts must re-register rather than heartbeat its way back.
pub fn transition_allowed(from: WorkerState, to: WorkerState) -> bool {
    use WorkerState::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Running, Paused)
            | (Paused, Running)
            | (Running, Draining)
            | (Draining, Stopped)
            | (Running, Stopped)
            | (Paused, Stopped)
            | (Offline, Running)
            | (Unknown, Running)
            | (Running | Paused | Draining | Offline | Unknown, Offline)
            | (_, Unknown)
    )
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_failed: u64,
}

/// Authoritative worker record, owned by the registry. Mutated only through
/// registry state transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub state: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub version: String,
    pub hostname: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub stats: WorkerStats,
    #[serde(default)]
    pub health: HashMap<String, f64>,
}

impl Worker {
    /// Fresh running record, as produced by registration.
    pub fn new(id: impl Into<String>, version: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state: WorkerState::Running,
            last_heartbeat: now,
            started_at: now,
            version: version.into(),
            hostname: String::new(),
            pid: 0,
            current_job: None,
            capabilities: vec![],
            labels: HashMap::new(),
            config: HashMap::new(),
            stats: WorkerStats::default(),
            health: HashMap::new(),
        }
    }

    /// A heartbeat exactly at the timeout boundary counts as alive; only
    /// strictly older heartbeats are expired.
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        let age = now - self.last_heartbeat;
        age > chrono::Duration::milliseconds(timeout.as_millis() as i64)
    }
}

/// Placeholder record for a key whose JSON failed to parse.
pub(crate) fn corrupted_stub(id: &str, now: DateTime<Utc>) -> Worker {
    let mut w = Worker::new(id, "", now);
    w.state = WorkerState::Unknown;
    w
}

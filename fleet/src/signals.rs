use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use common::clock::Clock;
use store::StateStore;
use store::keys::KeySpace;

use crate::error::FleetError;

/// Per-entry delivery TTL. A signal older than this is stale even if the
/// queue key survived.
const SIGNAL_TTL: Duration = Duration::from_secs(24 * 3600);

/// Worker-side blocking pull window.
pub const PULL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Pause,
    Resume,
    Drain,
    Stop,
    Restart,
}

/// One control signal delivered through a per-worker queue.
///
/// Delivery is best-effort: lost signals on worker restart are acceptable,
/// since the registry's state transitions are the source of truth.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSignal {
    pub id: Uuid,
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at_ms: u64,
}

impl WorkerSignal {
    pub fn new(kind: SignalKind, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            created_at: now,
            expires_at_ms: now.timestamp_millis() as u64 + SIGNAL_TTL.as_millis() as u64,
        }
    }
}

/// Ordered signal delivery over store-backed per-worker lists.
pub struct SignalChannel {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl SignalChannel {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Push a signal onto the worker's queue and refresh the key TTL.
    pub async fn push(
        &self,
        ks: &KeySpace,
        worker_id: &str,
        kind: SignalKind,
        payload: Value,
    ) -> Result<WorkerSignal, FleetError> {
        let signal = WorkerSignal::new(kind, payload, self.clock.now());
        let key = ks.worker_signals(worker_id);

        self.store
            .lpush(&key, &serde_json::to_string(&signal)?)
            .await?;
        self.store.expire(&key, SIGNAL_TTL).await?;

        debug!(worker_id = %worker_id, kind = ?kind, "signal queued");
        Ok(signal)
    }

    /// Worker-side blocking pull. Skips entries whose per-entry TTL lapsed;
    /// returns `None` once the timeout expires with nothing deliverable.
    pub async fn pull(
        &self,
        ks: &KeySpace,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<WorkerSignal>, FleetError> {
        let key = ks.worker_signals(worker_id);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let Some(raw) = self.store.brpop(&key, remaining).await? else {
                return Ok(None);
            };

            match serde_json::from_str::<WorkerSignal>(&raw) {
                Ok(signal) if signal.expires_at_ms > self.clock.now_ms() => {
                    return Ok(Some(signal));
                }
                Ok(signal) => {
                    debug!(worker_id = %worker_id, id = %signal.id, "dropping expired signal");
                }
                Err(e) => {
                    debug!(worker_id = %worker_id, error = %e, "dropping unreadable signal");
                }
            }
        }
    }
}

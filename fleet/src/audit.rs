use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::clock::Clock;
use store::StateStore;
use store::keys::KeySpace;

use crate::error::FleetError;

/// Hard cap on retained audit entries (LTRIM bound).
const MAX_ENTRIES: i64 = 10_000;

/// Structured, append-only record of one decision or action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub subjects: Vec<String>,
    pub reason: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AuditRecord {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        subjects: Vec<String>,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            actor: actor.into(),
            action: action.into(),
            subjects,
            reason: reason.into(),
            success: true,
            duration_ms: 0,
            error: None,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub subject: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Writes and queries the append-only audit log
/// (`worker:audit_logs`, newest first, LTRIM-bounded).
pub struct AuditRecorder {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    /// Age-based retention enforced by the trim loop.
    retention: Duration,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }

    pub async fn record(&self, ks: &KeySpace, record: &AuditRecord) -> Result<(), FleetError> {
        let key = ks.audit_log();
        self.store
            .lpush(&key, &serde_json::to_string(record)?)
            .await?;
        self.store.ltrim(&key, 0, MAX_ENTRIES - 1).await?;
        debug!(action = %record.action, actor = %record.actor, "audit record written");
        Ok(())
    }

    /// Newest-first query over the retained window.
    pub async fn query(
        &self,
        ks: &KeySpace,
        query: &AuditQuery,
    ) -> Result<Vec<AuditRecord>, FleetError> {
        let raw = self.store.lrange(&ks.audit_log(), 0, -1).await?;

        let mut out = Vec::new();
        for entry in raw {
            let Ok(record) = serde_json::from_str::<AuditRecord>(&entry) else {
                continue;
            };
            let keep = query.actor.as_ref().is_none_or(|a| &record.actor == a)
                && query.action.as_ref().is_none_or(|a| &record.action == a)
                && query
                    .subject
                    .as_ref()
                    .is_none_or(|s| record.subjects.iter().any(|x| x == s))
                && query.since.is_none_or(|t| record.timestamp >= t);
            if keep {
                out.push(record);
            }
            if let Some(limit) = query.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Drop entries older than the retention window. Entries are stored
    /// newest first, so retention is a single LTRIM at the cut index.
    pub async fn trim_expired(&self, ks: &KeySpace) -> Result<u64, FleetError> {
        let cutoff = self.clock.now()
            - chrono::Duration::milliseconds(self.retention.as_millis() as i64);
        let key = ks.audit_log();
        let raw = self.store.lrange(&key, 0, -1).await?;

        let keep = raw
            .iter()
            .take_while(|entry| {
                serde_json::from_str::<AuditRecord>(entry)
                    .map(|r| r.timestamp >= cutoff)
                    .unwrap_or(false)
            })
            .count();

        let dropped = raw.len() - keep;
        if dropped > 0 {
            if keep == 0 {
                self.store.del(&key).await?;
            } else {
                self.store.ltrim(&key, 0, keep as i64 - 1).await?;
            }
            info!(dropped, "audit retention trim");
        }
        Ok(dropped as u64)
    }

    /// Supervised periodic retention trim.
    pub async fn trim_loop(
        self: Arc<Self>,
        ks: KeySpace,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.trim_expired(&ks).await {
                        warn!(error = %e, "audit trim pass failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::clock::ManualClock;
    use store::MemoryStore;

    fn setup(retention_secs: u64) -> (AuditRecorder, KeySpace, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let recorder = AuditRecorder::new(
            store,
            Arc::new(clock.clone()),
            Duration::from_secs(retention_secs),
        );
        (recorder, KeySpace::default(), clock)
    }

    fn mk_record(actor: &str, action: &str, subject: &str, ts: DateTime<Utc>) -> AuditRecord {
        AuditRecord::new(actor, action, vec![subject.to_string()], "test", ts)
    }

    #[tokio::test]
    async fn records_are_queryable_newest_first() {
        let (recorder, ks, clock) = setup(3600);

        recorder
            .record(&ks, &mk_record("alice", "pause", "w-1", clock.now()))
            .await
            .unwrap();
        clock.advance_ms(1_000);
        recorder
            .record(&ks, &mk_record("bob", "stop", "w-2", clock.now()))
            .await
            .unwrap();

        let all = recorder.query(&ks, &AuditQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].actor, "bob", "newest first");

        let by_actor = recorder
            .query(
                &ks,
                &AuditQuery {
                    actor: Some("alice".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_actor.len(), 1);
        assert_eq!(by_actor[0].action, "pause");

        let by_subject = recorder
            .query(
                &ks,
                &AuditQuery {
                    subject: Some("w-2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_subject.len(), 1);
        assert_eq!(by_subject[0].actor, "bob");
    }

    #[tokio::test]
    async fn query_limit_caps_results() {
        let (recorder, ks, clock) = setup(3600);
        for i in 0..10 {
            recorder
                .record(&ks, &mk_record("alice", "pause", &format!("w-{i}"), clock.now()))
                .await
                .unwrap();
        }

        let limited = recorder
            .query(
                &ks,
                &AuditQuery {
                    limit: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 3);
    }

    #[tokio::test]
    async fn retention_trim_drops_old_entries() {
        let (recorder, ks, clock) = setup(60);

        recorder
            .record(&ks, &mk_record("alice", "pause", "old", clock.now()))
            .await
            .unwrap();
        clock.advance_ms(120_000);
        recorder
            .record(&ks, &mk_record("alice", "pause", "new", clock.now()))
            .await
            .unwrap();

        let dropped = recorder.trim_expired(&ks).await.unwrap();
        assert_eq!(dropped, 1);

        let remaining = recorder.query(&ks, &AuditQuery::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].subjects, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn trim_clears_fully_expired_log() {
        let (recorder, ks, clock) = setup(60);
        recorder
            .record(&ks, &mk_record("alice", "pause", "w-1", clock.now()))
            .await
            .unwrap();

        clock.advance_ms(10 * 60_000);
        let dropped = recorder.trim_expired(&ks).await.unwrap();
        assert_eq!(dropped, 1);
        assert!(recorder.query(&ks, &AuditQuery::default()).await.unwrap().is_empty());
    }
}

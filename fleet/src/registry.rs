use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use common::clock::Clock;
use common::events::{Event, EventBus, EventKind};
use store::keys::KeySpace;
use store::{StateStore, StateStoreExt};

use crate::error::FleetError;
use crate::worker::{Worker, WorkerState, corrupted_stub, transition_allowed};

#[derive(Clone, Debug)]
pub struct WorkerRegistryConfig {
    /// Heartbeats strictly older than this mark the worker offline.
    pub heartbeat_timeout: Duration,
    /// Reaper wake-up period.
    pub reap_interval: Duration,
}

impl Default for WorkerRegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WorkerFilter {
    pub state: Option<WorkerState>,
    pub version: Option<String>,
    pub label: Option<(String, String)>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    Id,
    LastHeartbeat,
    StartedAt,
}

#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Count after filtering, not raw membership.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FleetSummary {
    pub total: usize,
    pub running: usize,
    pub paused: usize,
    pub draining: usize,
    pub stopped: usize,
    pub offline: usize,
    pub unknown: usize,
}

impl FleetSummary {
    /// Workers that can take traffic right now.
    pub fn healthy(&self) -> usize {
        self.running
    }
}

/// Authoritative membership and health view of the fleet, backed by the
/// state store (`worker:<id>` records plus a `workers:index` membership set).
pub struct WorkerRegistry {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: WorkerRegistryConfig,
}

impl WorkerRegistry {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: WorkerRegistryConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &WorkerRegistryConfig {
        &self.config
    }

    /// Register (or re-register) a worker. A returning worker gets a fresh
    /// record regardless of its previous terminal state.
    #[instrument(skip(self, ks, worker), target = "registry", fields(worker_id = %worker.id))]
    pub async fn register(&self, ks: &KeySpace, worker: &Worker) -> Result<(), FleetError> {
        if worker.id.trim().is_empty() {
            return Err(FleetError::InvalidRequest("worker id must not be empty".into()));
        }

        self.store
            .set_json(&ks.worker(&worker.id), worker, None)
            .await?;
        self.store
            .zadd(&ks.worker_index(), &worker.id, self.clock.now_ms() as f64)
            .await?;

        debug!("worker registered");
        Ok(())
    }

    /// Update an existing record in place.
    pub async fn update(&self, ks: &KeySpace, worker: &Worker) -> Result<(), FleetError> {
        if !self.store.exists(&ks.worker(&worker.id)).await? {
            return Err(FleetError::WorkerNotFound(worker.id.clone()));
        }
        self.store
            .set_json(&ks.worker(&worker.id), worker, None)
            .await?;
        Ok(())
    }

    /// Fetch one worker. A record that fails to parse is replaced by an
    /// `unknown`-state stub rather than erroring the read path.
    pub async fn get(&self, ks: &KeySpace, id: &str) -> Result<Option<Worker>, FleetError> {
        let key = ks.worker(id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Worker>(&raw) {
            Ok(worker) => Ok(Some(worker)),
            Err(e) => {
                warn!(worker_id = %id, error = %e, "corrupted worker record; marking unknown");
                let stub = corrupted_stub(id, self.clock.now());
                self.store.set_json(&key, &stub, None).await?;
                Ok(Some(stub))
            }
        }
    }

    pub async fn remove(&self, ks: &KeySpace, id: &str) -> Result<bool, FleetError> {
        let existed = self.store.exists(&ks.worker(id)).await?;
        self.store.del(&ks.worker(id)).await?;
        self.store.zrem(&ks.worker_index(), id).await?;
        Ok(existed)
    }

    /// All known workers, unordered.
    pub async fn load_all(&self, ks: &KeySpace) -> Result<Vec<Worker>, FleetError> {
        let ids = self.store.zrange(&ks.worker_index(), 0, -1).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(worker) = self.get(ks, &id).await? {
                out.push(worker);
            } else {
                // Index entry with no record: membership drift, clean it up.
                self.store.zrem(&ks.worker_index(), &id).await?;
            }
        }
        Ok(out)
    }

    /// Filtered, sorted, paginated listing. `page` is 1-based and
    /// `page_size` is clamped into `[1, 1000]`.
    pub async fn list(
        &self,
        ks: &KeySpace,
        filter: &WorkerFilter,
        page: usize,
        page_size: usize,
        sort: SortField,
        descending: bool,
    ) -> Result<Page<Worker>, FleetError> {
        if page == 0 {
            return Err(FleetError::InvalidRequest("page must be >= 1".into()));
        }
        let page_size = page_size.clamp(1, 1_000);

        let mut workers = self.load_all(ks).await?;
        workers.retain(|w| {
            filter.state.is_none_or(|s| w.state == s)
                && filter.version.as_ref().is_none_or(|v| &w.version == v)
                && filter
                    .label
                    .as_ref()
                    .is_none_or(|(k, v)| w.labels.get(k) == Some(v))
        });

        match sort {
            SortField::Id => workers.sort_by(|a, b| a.id.cmp(&b.id)),
            SortField::LastHeartbeat => workers.sort_by_key(|w| w.last_heartbeat),
            SortField::StartedAt => workers.sort_by_key(|w| w.started_at),
        }
        if descending {
            workers.reverse();
        }

        let total = workers.len();
        let items = workers
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    pub async fn by_state(
        &self,
        ks: &KeySpace,
        state: WorkerState,
    ) -> Result<Vec<Worker>, FleetError> {
        let mut all = self.load_all(ks).await?;
        all.retain(|w| w.state == state);
        Ok(all)
    }

    pub async fn fleet_summary(&self, ks: &KeySpace) -> Result<FleetSummary, FleetError> {
        let mut summary = FleetSummary::default();
        for worker in self.load_all(ks).await? {
            summary.total += 1;
            match worker.state {
                WorkerState::Running => summary.running += 1,
                WorkerState::Paused => summary.paused += 1,
                WorkerState::Draining => summary.draining += 1,
                WorkerState::Stopped => summary.stopped += 1,
                WorkerState::Offline => summary.offline += 1,
                WorkerState::Unknown => summary.unknown += 1,
            }
        }
        Ok(summary)
    }

    /// Transition a worker along the state graph; invalid edges are rejected.
    #[instrument(skip(self, ks), target = "registry")]
    pub async fn set_state(
        &self,
        ks: &KeySpace,
        id: &str,
        to: WorkerState,
    ) -> Result<Worker, FleetError> {
        let mut worker = self
            .get(ks, id)
            .await?
            .ok_or_else(|| FleetError::WorkerNotFound(id.to_string()))?;

        if !transition_allowed(worker.state, to) {
            return Err(FleetError::InvalidTransition {
                from: worker.state,
                to,
            });
        }

        worker.state = to;
        self.store.set_json(&ks.worker(id), &worker, None).await?;
        debug!(worker_id = %id, state = %to, "worker state updated");
        Ok(worker)
    }

    /// Record a heartbeat. Heartbeats from stopped workers are dropped (the
    /// controller owns the terminal state); an offline worker is revived to
    /// running.
    pub async fn update_heartbeat(
        &self,
        ks: &KeySpace,
        id: &str,
        ts: DateTime<Utc>,
        current_job: Option<String>,
    ) -> Result<(), FleetError> {
        let mut worker = self
            .get(ks, id)
            .await?
            .ok_or_else(|| FleetError::WorkerNotFound(id.to_string()))?;

        if worker.state == WorkerState::Stopped {
            warn!(worker_id = %id, "dropping heartbeat from stopped worker; re-register required");
            return Ok(());
        }

        if matches!(worker.state, WorkerState::Offline | WorkerState::Unknown) {
            worker.state = WorkerState::Running;
            info!(worker_id = %id, "worker revived by fresh heartbeat");
        }

        worker.last_heartbeat = ts;
        worker.current_job = current_job;
        self.store.set_json(&ks.worker(id), &worker, None).await?;
        Ok(())
    }

    /// One reaper pass: expire heartbeats and return the ids taken offline.
    ///
    /// Never touches `draining` or `stopped` workers; those states are owned
    /// by explicit controller actions.
    #[instrument(skip(self, ks), target = "registry")]
    pub async fn reap_once(&self, ks: &KeySpace) -> Result<Vec<String>, FleetError> {
        let now = self.clock.now();
        let mut reaped = Vec::new();

        for mut worker in self.load_all(ks).await? {
            let untouchable = matches!(
                worker.state,
                WorkerState::Draining | WorkerState::Stopped | WorkerState::Offline
            );
            if untouchable || !worker.heartbeat_expired(now, self.config.heartbeat_timeout) {
                continue;
            }

            worker.state = WorkerState::Offline;
            self.store
                .set_json(&ks.worker(&worker.id), &worker, None)
                .await?;

            self.bus.publish(
                Event::new(EventKind::ActionApplied, "worker marked offline", now)
                    .with("worker_id", &worker.id)
                    .with("action", "mark_offline")
                    .with("actor", "heartbeat-reaper"),
            );
            reaped.push(worker.id);
        }

        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaper took workers offline");
        }
        Ok(reaped)
    }

    /// Supervised reaper loop. Runs until the token is cancelled; each pass
    /// is independent, so a store outage skips a beat rather than killing
    /// the task.
    pub async fn run_reaper(self: Arc<Self>, ks: KeySpace, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        info!("heartbeat reaper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("heartbeat reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once(&ks).await {
                        warn!(error = %e, "reaper pass failed");
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

    fn setup() -> (Arc<WorkerRegistry>, KeySpace, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let registry = Arc::new(WorkerRegistry::new(
            store,
            EventBus::default(),
            Arc::new(clock.clone()),
            WorkerRegistryConfig::default(),
        ));
        (registry, KeySpace::default(), clock)
    }

    fn mk_worker(id: &str, clock: &ManualClock) -> Worker {
        Worker::new(id, "1.0.0", clock.now())
    }

    #[tokio::test]
    async fn register_get_remove_roundtrip() {
        let (registry, ks, clock) = setup();
        registry.register(&ks, &mk_worker("w-1", &clock)).await.unwrap();

        let got = registry.get(&ks, "w-1").await.unwrap().unwrap();
        assert_eq!(got.state, WorkerState::Running);

        assert!(registry.remove(&ks, "w-1").await.unwrap());
        assert!(registry.get(&ks, "w-1").await.unwrap().is_none());
        assert!(!registry.remove(&ks, "w-1").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let (registry, ks, clock) = setup();
        registry.register(&ks, &mk_worker("w-1", &clock)).await.unwrap();

        registry.set_state(&ks, "w-1", WorkerState::Draining).await.unwrap();
        let err = registry
            .set_state(&ks, "w-1", WorkerState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));

        registry.set_state(&ks, "w-1", WorkerState::Stopped).await.unwrap();
        assert!(registry.set_state(&ks, "w-1", WorkerState::Running).await.is_err());
    }

    #[tokio::test]
    async fn heartbeat_revives_offline_but_not_stopped() {
        let (registry, ks, clock) = setup();
        registry.register(&ks, &mk_worker("w-1", &clock)).await.unwrap();
        registry.set_state(&ks, "w-1", WorkerState::Offline).await.unwrap();

        registry
            .update_heartbeat(&ks, "w-1", clock.now(), Some("job-1".into()))
            .await
            .unwrap();
        let w = registry.get(&ks, "w-1").await.unwrap().unwrap();
        assert_eq!(w.state, WorkerState::Running);
        assert_eq!(w.current_job.as_deref(), Some("job-1"));

        registry.set_state(&ks, "w-1", WorkerState::Stopped).await.unwrap();
        registry
            .update_heartbeat(&ks, "w-1", clock.now(), None)
            .await
            .unwrap();
        let w = registry.get(&ks, "w-1").await.unwrap().unwrap();
        assert_eq!(w.state, WorkerState::Stopped, "stopped is controller-owned");
    }

    #[tokio::test]
    async fn reaper_expires_stale_heartbeats_only() {
        let (registry, ks, clock) = setup();

        registry.register(&ks, &mk_worker("fresh", &clock)).await.unwrap();
        registry.register(&ks, &mk_worker("stale", &clock)).await.unwrap();
        registry.register(&ks, &mk_worker("draining", &clock)).await.unwrap();
        registry
            .set_state(&ks, "draining", WorkerState::Draining)
            .await
            .unwrap();

        // Everyone's heartbeat ages by 61s, then only `fresh` beats again.
        clock.advance_ms(61_000);
        registry
            .update_heartbeat(&ks, "fresh", clock.now(), None)
            .await
            .unwrap();

        let reaped = registry.reap_once(&ks).await.unwrap();
        assert_eq!(reaped, vec!["stale".to_string()]);

        assert_eq!(
            registry.get(&ks, "fresh").await.unwrap().unwrap().state,
            WorkerState::Running
        );
        assert_eq!(
            registry.get(&ks, "stale").await.unwrap().unwrap().state,
            WorkerState::Offline
        );
        assert_eq!(
            registry.get(&ks, "draining").await.unwrap().unwrap().state,
            WorkerState::Draining,
            "reaper must not overwrite draining"
        );
    }

    #[tokio::test]
    async fn heartbeat_exactly_at_timeout_survives_reaping() {
        let (registry, ks, clock) = setup();
        registry.register(&ks, &mk_worker("w-1", &clock)).await.unwrap();

        clock.advance_ms(60_000);
        let reaped = registry.reap_once(&ks).await.unwrap();
        assert!(reaped.is_empty(), "boundary heartbeat is alive");

        clock.advance_ms(1);
        let reaped = registry.reap_once(&ks).await.unwrap();
        assert_eq!(reaped.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_sorts_and_paginates() {
        let (registry, ks, clock) = setup();
        for i in 0..5 {
            let mut w = mk_worker(&format!("w-{i}"), &clock);
            if i % 2 == 0 {
                w.state = WorkerState::Paused;
            }
            registry.register(&ks, &w).await.unwrap();
        }

        let page = registry
            .list(
                &ks,
                &WorkerFilter {
                    state: Some(WorkerState::Paused),
                    ..Default::default()
                },
                1,
                2,
                SortField::Id,
                false,
            )
            .await
            .unwrap();

        assert_eq!(page.total, 3, "total reflects the filter, not membership");
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, "w-0");

        let page2 = registry
            .list(
                &ks,
                &WorkerFilter {
                    state: Some(WorkerState::Paused),
                    ..Default::default()
                },
                2,
                2,
                SortField::Id,
                false,
            )
            .await
            .unwrap();
        assert_eq!(page2.items.len(), 1);
        assert_eq!(page2.items[0].id, "w-4");

        assert!(registry
            .list(&ks, &WorkerFilter::default(), 0, 10, SortField::Id, false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn corrupted_record_becomes_unknown_stub() {
        let (registry, ks, _clock) = setup();
        // Simulate out-of-band corruption of a record.
        registry
            .store
            .set(&ks.worker("w-bad"), "{not json", None)
            .await
            .unwrap();
        registry
            .store
            .zadd(&ks.worker_index(), "w-bad", 0.0)
            .await
            .unwrap();

        let w = registry.get(&ks, "w-bad").await.unwrap().unwrap();
        assert_eq!(w.state, WorkerState::Unknown);

        // The stub was persisted: subsequent reads parse cleanly.
        let w = registry.get(&ks, "w-bad").await.unwrap().unwrap();
        assert_eq!(w.state, WorkerState::Unknown);
    }

    #[tokio::test]
    async fn fleet_summary_counts_states() {
        let (registry, ks, clock) = setup();
        registry.register(&ks, &mk_worker("a", &clock)).await.unwrap();
        registry.register(&ks, &mk_worker("b", &clock)).await.unwrap();
        registry.register(&ks, &mk_worker("c", &clock)).await.unwrap();
        registry.set_state(&ks, "b", WorkerState::Paused).await.unwrap();
        registry.set_state(&ks, "c", WorkerState::Draining).await.unwrap();

        let summary = registry.fleet_summary(&ks).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.paused, 1);
        assert_eq!(summary.draining, 1);
        assert_eq!(summary.healthy(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_loop_honors_cancellation() {
        let (registry, ks, _clock) = setup();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(registry.clone().run_reaper(ks, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        handle.await.expect("reaper task exits cleanly");
    }
}

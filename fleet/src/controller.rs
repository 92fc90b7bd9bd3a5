use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use common::clock::Clock;
use common::events::{Event, EventBus, EventKind};
use common::tenant::TenantContext;
use store::keys::KeySpace;

use crate::audit::{AuditRecord, AuditRecorder};
use crate::error::FleetError;
use crate::registry::{WorkerFilter, WorkerRegistry};
use crate::safety::{self, FleetAction, SafetyConfig};
use crate::signals::{SignalChannel, SignalKind};
use crate::worker::{WorkerState, transition_allowed};

#[derive(Clone, Debug)]
pub struct FleetControllerConfig {
    /// Drain timeout relayed to workers when the request does not set one.
    pub default_drain_timeout: Duration,
    /// Pause between rolling-restart phases when health checks are on.
    pub health_check_pause: Duration,
    pub safety: SafetyConfig,
}

impl Default for FleetControllerConfig {
    fn default() -> Self {
        Self {
            default_drain_timeout: Duration::from_secs(300),
            health_check_pause: Duration::from_secs(30),
            safety: SafetyConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionFailure {
    pub worker_id: String,
    pub error: String,
    pub code: String,
}

#[derive(Clone, Debug)]
pub struct ActionRequest {
    pub worker_ids: Vec<String>,
    pub action: FleetAction,
    pub reason: String,
    pub actor: String,
    pub force: bool,
    pub drain_timeout: Option<Duration>,
    pub confirmation: Option<String>,
}

impl ActionRequest {
    pub fn new(action: FleetAction, worker_ids: Vec<String>, reason: &str, actor: &str) -> Self {
        Self {
            worker_ids,
            action,
            reason: reason.to_string(),
            actor: actor.to_string(),
            force: false,
            drain_timeout: None,
            confirmation: None,
        }
    }
}

/// Progress of one fleet action. At every observation
/// `successful + failed + in_progress == total_requested`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub request_id: Uuid,
    pub action: FleetAction,
    pub total_requested: usize,
    pub successful: Vec<String>,
    pub failed: Vec<ActionFailure>,
    pub in_progress: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ActionStatus,
}

#[derive(Clone, Debug)]
pub struct RollingRestartRequest {
    pub filter: WorkerFilter,
    /// Workers restarted per phase.
    pub concurrency: usize,
    pub drain_timeout: Option<Duration>,
    pub restart_timeout: Option<Duration>,
    /// Extra clamp on phase size; 0 means no extra clamp.
    pub max_unavailable: usize,
    pub health_checks: bool,
    pub confirmation: Option<String>,
    pub reason: String,
    pub actor: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseResult {
    pub sequence: u32,
    pub worker_ids: Vec<String>,
    pub successful: Vec<String>,
    pub failed: Vec<ActionFailure>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollingRestartResponse {
    pub request_id: Uuid,
    pub total_workers: usize,
    pub phases: Vec<PhaseResult>,
    pub status: ActionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The Worker Fleet Controller: applies lifecycle actions with safety gates,
/// confirmation, signal fan-out, async progress tracking, and auditing.
///
/// Actions return immediately with `status = in_progress`; the work continues
/// in a background task and callers poll `get_status` or watch the bus. No
/// state is mutated before the safety checks pass.
pub struct FleetController {
    registry: Arc<WorkerRegistry>,
    signals: Arc<SignalChannel>,
    audit: Arc<AuditRecorder>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: FleetControllerConfig,
    inflight: Arc<Mutex<HashMap<Uuid, ActionResponse>>>,
}

impl FleetController {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        signals: Arc<SignalChannel>,
        audit: Arc<AuditRecorder>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: FleetControllerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            signals,
            audit,
            bus,
            clock,
            config,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    // ---- public action API --------------------------------------------------

    pub async fn pause(
        self: &Arc<Self>,
        ctx: &TenantContext,
        workers: Vec<String>,
        reason: &str,
        actor: &str,
    ) -> Result<ActionResponse, FleetError> {
        self.execute(ctx, ActionRequest::new(FleetAction::Pause, workers, reason, actor))
            .await
    }

    pub async fn resume(
        self: &Arc<Self>,
        ctx: &TenantContext,
        workers: Vec<String>,
        reason: &str,
        actor: &str,
    ) -> Result<ActionResponse, FleetError> {
        self.execute(ctx, ActionRequest::new(FleetAction::Resume, workers, reason, actor))
            .await
    }

    pub async fn drain(
        self: &Arc<Self>,
        ctx: &TenantContext,
        workers: Vec<String>,
        reason: &str,
        actor: &str,
    ) -> Result<ActionResponse, FleetError> {
        self.execute(ctx, ActionRequest::new(FleetAction::Drain, workers, reason, actor))
            .await
    }

    pub async fn stop(
        self: &Arc<Self>,
        ctx: &TenantContext,
        workers: Vec<String>,
        reason: &str,
        actor: &str,
    ) -> Result<ActionResponse, FleetError> {
        self.execute(ctx, ActionRequest::new(FleetAction::Stop, workers, reason, actor))
            .await
    }

    pub async fn restart(
        self: &Arc<Self>,
        ctx: &TenantContext,
        workers: Vec<String>,
        reason: &str,
        actor: &str,
    ) -> Result<ActionResponse, FleetError> {
        self.execute(ctx, ActionRequest::new(FleetAction::Restart, workers, reason, actor))
            .await
    }

    /// Validate, gate, and launch an action. Returns immediately; the
    /// response snapshot is `in_progress` for every subject.
    #[instrument(
        skip(self, ctx, request),
        target = "controller",
        fields(action = %request.action, subjects = request.worker_ids.len())
    )]
    pub async fn execute(
        self: &Arc<Self>,
        ctx: &TenantContext,
        request: ActionRequest,
    ) -> Result<ActionResponse, FleetError> {
        if request.worker_ids.is_empty() {
            return Err(FleetError::InvalidRequest("no workers selected".into()));
        }

        let ks = KeySpace::for_tenant(ctx);
        let summary = self.registry.fleet_summary(&ks).await?;

        safety::validate(
            &self.config.safety,
            request.action,
            request.worker_ids.len(),
            request.force,
            &summary,
        )?;
        if safety::requires_confirmation(request.action, request.worker_ids.len(), &summary) {
            safety::validate_confirmation(request.confirmation.as_deref())?;
        }
        safety::check_fleet_health(&summary, request.worker_ids.len());

        let response = ActionResponse {
            request_id: Uuid::new_v4(),
            action: request.action,
            total_requested: request.worker_ids.len(),
            successful: vec![],
            failed: vec![],
            in_progress: request.worker_ids.clone(),
            started_at: self.clock.now(),
            completed_at: None,
            status: ActionStatus::InProgress,
        };
        self.inflight
            .lock()
            .insert(response.request_id, response.clone());

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.run_action(ks, request, response.request_id).await;
        });

        Ok(self
            .get_status(response.request_id)
            .unwrap_or(response))
    }

    pub fn get_status(&self, request_id: Uuid) -> Option<ActionResponse> {
        self.inflight.lock().get(&request_id).cloned()
    }

    /// Worker-agent entry point: blocking pull of the next control signal
    /// for `worker_id`, bounded by the standard pull window.
    pub async fn worker_pull_signal(
        &self,
        ctx: &TenantContext,
        worker_id: &str,
    ) -> Result<Option<crate::signals::WorkerSignal>, FleetError> {
        self.signals
            .pull(&KeySpace::for_tenant(ctx), worker_id, crate::signals::PULL_TIMEOUT)
            .await
    }

    /// Mark an in-flight request cancelled. Partial progress is preserved;
    /// the background task observes the status and stops at the next worker.
    pub fn cancel(&self, request_id: Uuid) -> Result<ActionResponse, FleetError> {
        let mut inflight = self.inflight.lock();
        let response = inflight
            .get_mut(&request_id)
            .ok_or(FleetError::RequestNotFound(request_id))?;

        if matches!(
            response.status,
            ActionStatus::Pending | ActionStatus::InProgress
        ) {
            response.status = ActionStatus::Cancelled;
            response.completed_at = Some(self.clock.now());
        }
        Ok(response.clone())
    }

    // ---- background execution ----------------------------------------------

    async fn run_action(&self, ks: KeySpace, request: ActionRequest, request_id: Uuid) {
        let started = std::time::Instant::now();

        for worker_id in &request.worker_ids {
            let cancelled = self
                .get_status(request_id)
                .is_some_and(|r| r.status == ActionStatus::Cancelled);
            if cancelled {
                debug!(%request_id, "action cancelled; stopping fan-out");
                break;
            }

            let outcome = self
                .apply_one(&ks, request.action, worker_id, request.drain_timeout, request.force)
                .await;

            let mut inflight = self.inflight.lock();
            if let Some(response) = inflight.get_mut(&request_id) {
                response.in_progress.retain(|id| id != worker_id);
                match outcome {
                    Ok(()) => response.successful.push(worker_id.clone()),
                    Err((error, code)) => response.failed.push(ActionFailure {
                        worker_id: worker_id.clone(),
                        error,
                        code,
                    }),
                }
            }
        }

        let snapshot = {
            let mut inflight = self.inflight.lock();
            let Some(response) = inflight.get_mut(&request_id) else {
                return;
            };
            if response.status != ActionStatus::Cancelled {
                response.status = if response.successful.is_empty() && !response.failed.is_empty()
                {
                    ActionStatus::Failed
                } else {
                    ActionStatus::Completed
                };
                response.completed_at = Some(self.clock.now());
            }
            response.clone()
        };

        let mut audit = AuditRecord::new(
            &request.actor,
            snapshot.action.to_string(),
            request.worker_ids.clone(),
            &request.reason,
            self.clock.now(),
        );
        audit.success = snapshot.status == ActionStatus::Completed;
        audit.duration_ms = started.elapsed().as_millis() as u64;
        audit.metadata.insert("request_id".into(), json!(request_id));
        audit
            .metadata
            .insert("failed".into(), json!(snapshot.failed.len()));
        if let Err(e) = self.audit.record(&ks, &audit).await {
            warn!(error = %e, "audit write failed");
        }

        self.bus.publish(
            Event::new(EventKind::ActionApplied, "fleet action finished", self.clock.now())
                .with("request_id", request_id)
                .with("action", snapshot.action.to_string())
                .with("successful", snapshot.successful.len())
                .with("failed", snapshot.failed.len())
                .with("status", format!("{:?}", snapshot.status)),
        );

        info!(
            %request_id,
            action = %snapshot.action,
            ok = snapshot.successful.len(),
            failed = snapshot.failed.len(),
            "fleet action finished"
        );
    }

    /// Apply one action to one worker: signal first, then the registry
    /// transition (the registry is the source of truth; the signal is
    /// best-effort delivery).
    async fn apply_one(
        &self,
        ks: &KeySpace,
        action: FleetAction,
        worker_id: &str,
        drain_timeout: Option<Duration>,
        force: bool,
    ) -> Result<(), (String, String)> {
        let worker = match self.registry.get(ks, worker_id).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                return Err((format!("worker {worker_id} not found"), "not_found".into()));
            }
            Err(e) => return Err((e.to_string(), "store_error".into())),
        };

        let (kind, payload, target) = match action {
            FleetAction::Pause => (SignalKind::Pause, json!(null), Some(WorkerState::Paused)),
            FleetAction::Resume => (SignalKind::Resume, json!(null), Some(WorkerState::Running)),
            FleetAction::Drain => {
                let timeout = drain_timeout.unwrap_or(self.config.default_drain_timeout);
                (
                    SignalKind::Drain,
                    json!({"timeout_secs": timeout.as_secs()}),
                    Some(WorkerState::Draining),
                )
            }
            FleetAction::Stop => (
                SignalKind::Stop,
                json!({"force": force}),
                Some(WorkerState::Stopped),
            ),
            // The worker re-registers after restarting; no persisted change.
            FleetAction::Restart => (SignalKind::Restart, json!(null), None),
        };

        if let Some(to) = target {
            if !transition_allowed(worker.state, to) {
                return Err((
                    format!("cannot {action} a {} worker", worker.state),
                    "invalid_transition".into(),
                ));
            }
        }

        if let Err(e) = self.signals.push(ks, worker_id, kind, payload).await {
            return Err((e.to_string(), "signal_error".into()));
        }

        if let Some(to) = target {
            if let Err(e) = self.registry.set_state(ks, worker_id, to).await {
                return Err((e.to_string(), "transition_error".into()));
            }
        }
        Ok(())
    }

    // ---- rolling restart ----------------------------------------------------

    /// Phased drain+restart across the matched workers. Phases run
    /// sequentially at `concurrency` width; with health checks enabled the
    /// controller waits between phases to let the fleet settle.
    #[instrument(skip(self, ctx, request), target = "controller")]
    pub async fn rolling_restart(
        self: &Arc<Self>,
        ctx: &TenantContext,
        request: RollingRestartRequest,
    ) -> Result<RollingRestartResponse, FleetError> {
        if request.concurrency == 0 {
            return Err(FleetError::InvalidRequest("concurrency must be >= 1".into()));
        }

        let ks = KeySpace::for_tenant(ctx);
        let matched = self
            .registry
            .list(&ks, &request.filter, 1, 1_000, crate::registry::SortField::Id, false)
            .await?
            .items;
        if matched.is_empty() {
            return Err(FleetError::InvalidRequest(
                "no workers match the restart filter".into(),
            ));
        }

        let summary = self.registry.fleet_summary(&ks).await?;
        if safety::requires_confirmation(FleetAction::Restart, matched.len(), &summary) {
            safety::validate_confirmation(request.confirmation.as_deref())?;
        }

        let phase_size = if request.max_unavailable > 0 {
            request.concurrency.min(request.max_unavailable)
        } else {
            request.concurrency
        };

        let request_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let ids: Vec<String> = matched.into_iter().map(|w| w.id).collect();
        let mut phases = Vec::new();

        let phase_count = ids.len().div_ceil(phase_size);
        info!(
            %request_id,
            workers = ids.len(),
            phase_size,
            phases = phase_count,
            "rolling restart started"
        );

        for (sequence, chunk) in ids.chunks(phase_size).enumerate() {
            let mut phase = PhaseResult {
                sequence: sequence as u32,
                worker_ids: chunk.to_vec(),
                successful: vec![],
                failed: vec![],
            };

            for worker_id in chunk {
                let drained = self
                    .apply_one(&ks, FleetAction::Drain, worker_id, request.drain_timeout, false)
                    .await;

                match drained {
                    Ok(()) => {
                        // Restart rides behind the drain in the same queue.
                        if let Err(e) = self
                            .signals
                            .push(&ks, worker_id, SignalKind::Restart, json!(null))
                            .await
                        {
                            phase.failed.push(ActionFailure {
                                worker_id: worker_id.clone(),
                                error: e.to_string(),
                                code: "signal_error".into(),
                            });
                        } else {
                            phase.successful.push(worker_id.clone());
                        }
                    }
                    Err((error, code)) => {
                        phase.failed.push(ActionFailure {
                            worker_id: worker_id.clone(),
                            error,
                            code,
                        });
                    }
                }
            }

            debug!(
                phase = sequence,
                ok = phase.successful.len(),
                failed = phase.failed.len(),
                "rolling restart phase complete"
            );
            let last = sequence + 1 == phase_count;
            phases.push(phase);

            if request.health_checks && !last {
                tokio::time::sleep(self.config.health_check_pause).await;
            }
        }

        let total_ok: usize = phases.iter().map(|p| p.successful.len()).sum();
        let total_failed: usize = phases.iter().map(|p| p.failed.len()).sum();
        let status = if total_ok == 0 && total_failed > 0 {
            ActionStatus::Failed
        } else {
            ActionStatus::Completed
        };

        let mut audit = AuditRecord::new(
            &request.actor,
            "rolling_restart",
            ids.clone(),
            &request.reason,
            self.clock.now(),
        );
        audit.success = status == ActionStatus::Completed;
        audit.metadata.insert("phases".into(), json!(phases.len()));
        audit.metadata.insert("failed".into(), json!(total_failed));
        if let Err(e) = self.audit.record(&ks, &audit).await {
            warn!(error = %e, "audit write failed");
        }

        self.bus.publish(
            Event::new(EventKind::ActionApplied, "rolling restart finished", self.clock.now())
                .with("request_id", request_id)
                .with("action", "rolling_restart")
                .with("workers", ids.len())
                .with("phases", phases.len())
                .with("failed", total_failed),
        );

        Ok(RollingRestartResponse {
            request_id,
            total_workers: ids.len(),
            phases,
            status,
            started_at,
            completed_at: Some(self.clock.now()),
        })
    }
}

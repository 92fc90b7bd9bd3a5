use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use common::clock::Clock;
use common::events::{Event, EventBus, EventKind};
use store::keys::KeySpace;
use store::{StateStore, StateStoreExt};

use crate::error::RetryError;
use crate::types::Guardrails;

/// Error classes treated as validation failures by `stop_on_validation`
/// policies. Matching is case-insensitive substring.
pub const VALIDATION_ERROR_CLASSES: [&str; 4] =
    ["validation", "invalid_input", "malformed", "schema_error"];

pub fn is_validation_error(error_class: &str) -> bool {
    let lowered = error_class.to_ascii_lowercase();
    VALIDATION_ERROR_CLASSES
        .iter()
        .any(|p| lowered.contains(p))
}

/// Declarative retry rule. Policies are evaluated highest-priority first;
/// the first policy whose error or job-type pattern matches wins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub name: String,
    pub error_patterns: Vec<String>,
    pub job_type_patterns: Vec<String>,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Total jitter width in percent of the delay, in [0, 100].
    pub jitter_percent: f64,
    pub stop_on_validation: bool,
    pub priority: i32,
}

/// A policy with its patterns compiled once. Regexes are evaluated on every
/// recommendation, so compilation happens at load/update time only.
pub(crate) struct CompiledPolicy {
    pub policy: RetryPolicy,
    error_regexes: Vec<Regex>,
    job_type_regexes: Vec<Regex>,
}

impl CompiledPolicy {
    fn compile(policy: RetryPolicy) -> Result<Self, RetryError> {
        let compile_all = |patterns: &[String]| -> Result<Vec<Regex>, RetryError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        RetryError::InvalidPolicy(format!("bad pattern {p:?}: {e}"))
                    })
                })
                .collect()
        };

        Ok(Self {
            error_regexes: compile_all(&policy.error_patterns)?,
            job_type_regexes: compile_all(&policy.job_type_patterns)?,
            policy,
        })
    }

    pub fn matches(&self, error_class: Option<&str>, job_type: &str) -> bool {
        let error_hit = error_class
            .map(|ec| self.error_regexes.iter().any(|re| re.is_match(ec)))
            .unwrap_or(false);
        let job_hit = self.job_type_regexes.iter().any(|re| re.is_match(job_type));
        error_hit || job_hit
    }
}

/// Serialized form of the process-wide retry strategy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StrategySnapshot {
    policies: Vec<RetryPolicy>,
    #[serde(default)]
    guardrails: Option<Guardrails>,
}

/// The process-wide mutable retry strategy: the ordered policy list plus the
/// global guardrails.
///
/// Reads (the recommendation hot path) take only the read lock. Mutations are
/// serialized by an async mutation lock, applied under the write lock, then
/// persisted to `retry:strategy` and announced on the bus.
pub struct StrategyStore {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    policies: RwLock<Vec<CompiledPolicy>>,
    guardrails: RwLock<Guardrails>,
    mutation: tokio::sync::Mutex<()>,
}

impl StrategyStore {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            policies: RwLock::new(Vec::new()),
            guardrails: RwLock::new(Guardrails::default()),
            mutation: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the persisted strategy. Missing key leaves the defaults in place.
    #[instrument(skip(self, ks), target = "retry_policy")]
    pub async fn load(&self, ks: &KeySpace) -> Result<usize, RetryError> {
        let Some(snapshot) = self
            .store
            .get_json::<StrategySnapshot>(&ks.strategy())
            .await?
        else {
            debug!("no persisted strategy; starting empty");
            return Ok(0);
        };

        let mut compiled = snapshot
            .policies
            .into_iter()
            .map(CompiledPolicy::compile)
            .collect::<Result<Vec<_>, _>>()?;
        compiled.sort_by(|a, b| b.policy.priority.cmp(&a.policy.priority));

        let count = compiled.len();
        *self.policies.write() = compiled;
        if let Some(g) = snapshot.guardrails {
            *self.guardrails.write() = g;
        }

        info!(count, "retry strategy loaded");
        Ok(count)
    }

    fn validate(policy: &RetryPolicy) -> Result<(), RetryError> {
        if policy.name.trim().is_empty() {
            return Err(RetryError::InvalidPolicy("name must not be empty".into()));
        }
        if policy.priority < 0 {
            return Err(RetryError::InvalidPolicy(format!(
                "priority must be >= 0, got {}",
                policy.priority
            )));
        }
        if policy.max_attempts == 0 {
            return Err(RetryError::InvalidPolicy("max_attempts must be >= 1".into()));
        }
        if policy.base_delay_ms > policy.max_delay_ms {
            return Err(RetryError::InvalidPolicy(format!(
                "base_delay_ms {} exceeds max_delay_ms {}",
                policy.base_delay_ms, policy.max_delay_ms
            )));
        }
        if policy.backoff_multiplier <= 0.0 {
            return Err(RetryError::InvalidPolicy(
                "backoff_multiplier must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&policy.jitter_percent) {
            return Err(RetryError::InvalidPolicy(format!(
                "jitter_percent must be in [0,100], got {}",
                policy.jitter_percent
            )));
        }
        Ok(())
    }

    /// Add a policy. Duplicate names and invalid definitions are rejected;
    /// the list is re-sorted and persisted on success.
    #[instrument(skip(self, ks, policy), target = "retry_policy", fields(name = %policy.name))]
    pub async fn add_policy(&self, ks: &KeySpace, policy: RetryPolicy) -> Result<(), RetryError> {
        Self::validate(&policy)?;
        let _guard = self.mutation.lock().await;

        {
            let mut list = self.policies.write();
            if list.iter().any(|c| c.policy.name == policy.name) {
                return Err(RetryError::DuplicatePolicy(policy.name));
            }
            list.push(CompiledPolicy::compile(policy)?);
            list.sort_by(|a, b| b.policy.priority.cmp(&a.policy.priority));
        }

        self.persist(ks).await?;
        self.announce("policy added");
        Ok(())
    }

    /// Remove a policy by name. Idempotent: returns whether it existed.
    #[instrument(skip(self, ks), target = "retry_policy")]
    pub async fn remove_policy(&self, ks: &KeySpace, name: &str) -> Result<bool, RetryError> {
        let _guard = self.mutation.lock().await;

        let removed = {
            let mut list = self.policies.write();
            let before = list.len();
            list.retain(|c| c.policy.name != name);
            before != list.len()
        };

        if removed {
            self.persist(ks).await?;
            self.announce("policy removed");
        }
        Ok(removed)
    }

    /// Current policies, highest priority first.
    pub fn policies(&self) -> Vec<RetryPolicy> {
        self.policies.read().iter().map(|c| c.policy.clone()).collect()
    }

    pub fn guardrails(&self) -> Guardrails {
        *self.guardrails.read()
    }

    pub async fn update_guardrails(
        &self,
        ks: &KeySpace,
        guardrails: Guardrails,
    ) -> Result<(), RetryError> {
        if guardrails.max_attempts == 0 {
            return Err(RetryError::Config("max_attempts must be >= 1".into()));
        }
        if guardrails.max_delay_ms == 0 {
            return Err(RetryError::Config("max_delay_ms must be positive".into()));
        }

        let _guard = self.mutation.lock().await;
        *self.guardrails.write() = guardrails;
        self.persist(ks).await?;
        self.announce("guardrails updated");
        Ok(())
    }

    pub async fn set_emergency_stop(&self, ks: &KeySpace, on: bool) -> Result<(), RetryError> {
        let _guard = self.mutation.lock().await;
        self.guardrails.write().emergency_stop = on;
        self.persist(ks).await?;
        self.announce(if on { "emergency stop set" } else { "emergency stop cleared" });
        Ok(())
    }

    /// First matching policy in priority order.
    pub(crate) fn find_match(
        &self,
        error_class: Option<&str>,
        job_type: &str,
    ) -> Option<RetryPolicy> {
        self.policies
            .read()
            .iter()
            .find(|c| c.matches(error_class, job_type))
            .map(|c| c.policy.clone())
    }

    async fn persist(&self, ks: &KeySpace) -> Result<(), RetryError> {
        let snapshot = StrategySnapshot {
            policies: self.policies(),
            guardrails: Some(self.guardrails()),
        };
        self.store.set_json(&ks.strategy(), &snapshot, None).await?;
        Ok(())
    }

    fn announce(&self, message: &str) {
        self.bus.publish(Event::new(
            EventKind::PolicyUpdated,
            message,
            self.clock.now(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::clock::ManualClock;
    use store::MemoryStore;

    fn mk_policy(name: &str, priority: i32) -> RetryPolicy {
        RetryPolicy {
            name: name.into(),
            error_patterns: vec!["timeout".into()],
            job_type_patterns: vec![],
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_percent: 10.0,
            stop_on_validation: false,
            priority,
        }
    }

    fn setup() -> (Arc<StrategyStore>, KeySpace, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let strategy = Arc::new(StrategyStore::new(
            store.clone(),
            EventBus::default(),
            clock,
        ));
        (strategy, KeySpace::default(), store)
    }

    #[tokio::test]
    async fn add_rejects_duplicates_and_invalid() {
        let (strategy, ks, _) = setup();

        strategy.add_policy(&ks, mk_policy("a", 10)).await.unwrap();
        assert!(matches!(
            strategy.add_policy(&ks, mk_policy("a", 20)).await,
            Err(RetryError::DuplicatePolicy(_))
        ));

        let mut bad = mk_policy("b", -1);
        assert!(matches!(
            strategy.add_policy(&ks, bad.clone()).await,
            Err(RetryError::InvalidPolicy(_))
        ));

        bad.priority = 1;
        bad.base_delay_ms = 100_000;
        assert!(matches!(
            strategy.add_policy(&ks, bad.clone()).await,
            Err(RetryError::InvalidPolicy(_))
        ));

        bad.base_delay_ms = 100;
        bad.error_patterns = vec!["([unclosed".into()];
        assert!(matches!(
            strategy.add_policy(&ks, bad).await,
            Err(RetryError::InvalidPolicy(_))
        ));
    }

    #[tokio::test]
    async fn list_is_priority_descending() {
        let (strategy, ks, _) = setup();
        strategy.add_policy(&ks, mk_policy("low", 1)).await.unwrap();
        strategy.add_policy(&ks, mk_policy("high", 100)).await.unwrap();
        strategy.add_policy(&ks, mk_policy("mid", 50)).await.unwrap();

        let names: Vec<String> = strategy.policies().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (strategy, ks, _) = setup();
        strategy.add_policy(&ks, mk_policy("a", 1)).await.unwrap();

        assert!(strategy.remove_policy(&ks, "a").await.unwrap());
        assert!(!strategy.remove_policy(&ks, "a").await.unwrap());
    }

    #[tokio::test]
    async fn strategy_survives_reload_losslessly() {
        let (strategy, ks, store) = setup();
        strategy.add_policy(&ks, mk_policy("a", 10)).await.unwrap();
        strategy.add_policy(&ks, mk_policy("b", 5)).await.unwrap();
        strategy
            .update_guardrails(
                &ks,
                Guardrails {
                    max_attempts: 7,
                    max_delay_ms: 120_000,
                    emergency_stop: false,
                },
            )
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let reloaded = StrategyStore::new(store, EventBus::default(), clock);
        assert_eq!(reloaded.load(&ks).await.unwrap(), 2);
        assert_eq!(reloaded.policies(), strategy.policies());
        assert_eq!(reloaded.guardrails().max_attempts, 7);
    }

    #[tokio::test]
    async fn find_match_uses_priority_and_patterns() {
        let (strategy, ks, _) = setup();

        let mut network = mk_policy("network", 10);
        network.error_patterns = vec!["timeout|connection".into()];
        strategy.add_policy(&ks, network).await.unwrap();

        let mut broad = mk_policy("broad", 1);
        broad.error_patterns = vec![".*".into()];
        strategy.add_policy(&ks, broad).await.unwrap();

        let hit = strategy.find_match(Some("connection_reset"), "email").unwrap();
        assert_eq!(hit.name, "network");

        let hit = strategy.find_match(Some("oom"), "email").unwrap();
        assert_eq!(hit.name, "broad");

        let mut by_job = mk_policy("reports", 50);
        by_job.error_patterns = vec![];
        by_job.job_type_patterns = vec!["^report_".into()];
        strategy.add_policy(&ks, by_job).await.unwrap();

        let hit = strategy.find_match(None, "report_daily").unwrap();
        assert_eq!(hit.name, "reports");
    }

    #[test]
    fn validation_error_set_matches_substrings() {
        assert!(is_validation_error("validation_error"));
        assert!(is_validation_error("INVALID_INPUT"));
        assert!(is_validation_error("payload_malformed"));
        assert!(is_validation_error("schema_error"));
        assert!(!is_validation_error("timeout"));
    }
}

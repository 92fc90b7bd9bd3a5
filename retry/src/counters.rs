use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub rec_total: Arc<AtomicU64>,
    pub rec_guardrails: Arc<AtomicU64>,
    pub rec_supervised: Arc<AtomicU64>,
    pub rec_bayesian: Arc<AtomicU64>,
    pub rec_rules: Arc<AtomicU64>,
    pub rec_default: Arc<AtomicU64>,

    pub rec_degraded: Arc<AtomicU64>,
    pub attempts_recorded: Arc<AtomicU64>,
    pub attempts_skipped: Arc<AtomicU64>,
}

use common::tenant::TenantContext;

/// Fixed key schema, scoped by tenant namespace.
///
/// Every persisted structure lives under one of these patterns; no engine
/// writes another engine's key space. Constructing keys through this type is
/// what keeps tenants isolated: the namespace prefix comes from the resolved
/// [`TenantContext`] and nothing else.
#[derive(Clone, Debug, Default)]
pub struct KeySpace {
    ns: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            ns: namespace.into(),
        }
    }

    pub fn for_tenant(ctx: &TenantContext) -> Self {
        Self::new(ctx.namespace.clone())
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// `retry:attempt:<job_id>:<attempt>`
    pub fn attempt(&self, job_id: &str, attempt: u32) -> String {
        format!("{}retry:attempt:{}:{}", self.ns, job_id, attempt)
    }

    /// Scan pattern covering all attempt records in this namespace.
    pub fn attempt_scan(&self) -> String {
        format!("{}retry:attempt:*", self.ns)
    }

    /// `retry:stats:<job_type>:<error_class>`
    pub fn stats(&self, job_type: &str, error_class: &str) -> String {
        format!("{}retry:stats:{}:{}", self.ns, job_type, error_class)
    }

    /// `retry:bayesian:<job_type>:<error_class>`
    pub fn bayesian(&self, job_type: &str, error_class: &str) -> String {
        format!("{}retry:bayesian:{}:{}", self.ns, job_type, error_class)
    }

    /// `retry:ml_model`: the active supervised model.
    pub fn ml_model(&self) -> String {
        format!("{}retry:ml_model", self.ns)
    }

    /// `retry:strategy`: the persisted policy list + guardrails.
    pub fn strategy(&self) -> String {
        format!("{}retry:strategy", self.ns)
    }

    /// `worker:<id>`
    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}worker:{}", self.ns, worker_id)
    }

    /// `workers:index`: fleet membership zset (score = registered_at ms).
    pub fn worker_index(&self) -> String {
        format!("{}workers:index", self.ns)
    }

    /// `worker:signals:<id>`: per-worker signal delivery list.
    pub fn worker_signals(&self, worker_id: &str) -> String {
        format!("{}worker:signals:{}", self.ns, worker_id)
    }

    /// `worker:audit_logs`: append-only audit list.
    pub fn audit_log(&self) -> String {
        format!("{}worker:audit_logs", self.ns)
    }

    /// `capacity:plan:<queue>`
    pub fn capacity_plan(&self, queue: &str) -> String {
        format!("{}capacity:plan:{}", self.ns, queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscoped_keys_match_documented_patterns() {
        let ks = KeySpace::default();
        assert_eq!(ks.attempt("job-9", 3), "retry:attempt:job-9:3");
        assert_eq!(ks.stats("email", "timeout"), "retry:stats:email:timeout");
        assert_eq!(
            ks.bayesian("email", "timeout"),
            "retry:bayesian:email:timeout"
        );
        assert_eq!(ks.ml_model(), "retry:ml_model");
        assert_eq!(ks.strategy(), "retry:strategy");
        assert_eq!(ks.worker("w-1"), "worker:w-1");
        assert_eq!(ks.worker_index(), "workers:index");
        assert_eq!(ks.worker_signals("w-1"), "worker:signals:w-1");
        assert_eq!(ks.audit_log(), "worker:audit_logs");
        assert_eq!(ks.capacity_plan("emails"), "capacity:plan:emails");
    }

    #[test]
    fn tenant_namespace_prefixes_every_key() {
        let ctx = TenantContext::scoped("acme");
        let ks = KeySpace::for_tenant(&ctx);
        assert_eq!(ks.ml_model(), "t:acme:retry:ml_model");
        assert_eq!(ks.worker("w-1"), "t:acme:worker:w-1");
    }
}

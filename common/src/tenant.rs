use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resolved tenant scope passed through every recommendation, plan, and fleet
/// action. The namespace prefixes every store key touched on behalf of the
/// tenant, which is what isolates tenants from each other.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: Option<String>,
    pub active: bool,
    /// Store key prefix; empty for single-tenant deployments.
    pub namespace: String,
    /// Rate-limit bucket key owned by the access-control collaborator.
    pub rate_limit_key: Option<String>,
}

impl TenantContext {
    /// Context for single-tenant deployments: no prefix, always active.
    pub fn unscoped() -> Self {
        Self {
            tenant_id: None,
            active: true,
            namespace: String::new(),
            rate_limit_key: None,
        }
    }

    pub fn scoped(tenant_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            namespace: format!("t:{tenant_id}:"),
            rate_limit_key: Some(format!("t:{tenant_id}:ratelimit")),
            tenant_id: Some(tenant_id),
            active: true,
        }
    }
}

/// Access-control collaborator. Tenant CRUD, encryption, and quota
/// enforcement live behind this boundary; the core only resolves.
#[async_trait]
pub trait TenantAuthority: Send + Sync {
    async fn resolve(&self, tenant_id: &str) -> Result<TenantContext>;
}

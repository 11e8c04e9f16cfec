//! Tenant resolution.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::TenantId;

/// Tenant resolution errors.
#[derive(Error, Debug)]
pub enum TenantError {
    /// No tenant could be resolved for the current caller.
    #[error("No tenant resolved")]
    Unresolved,

    /// Resolver backend failed.
    #[error("Tenant resolution failed: {0}")]
    Backend(String),
}

/// Resolves the tenant the current caller is authenticated as.
///
/// The result is compared against the tenant an execution context declares;
/// the two must agree before any step runs.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// Get the currently resolved tenant.
    async fn current_tenant(&self) -> Result<TenantId, TenantError>;
}

/// Resolver that always returns a fixed tenant.
///
/// Used by hosts that run one tenant per process (the CLI) and in tests.
#[derive(Debug, Clone)]
pub struct StaticTenantResolver {
    tenant: TenantId,
}

impl StaticTenantResolver {
    /// Create a resolver for `tenant`.
    #[must_use]
    pub const fn new(tenant: TenantId) -> Self {
        Self { tenant }
    }
}

#[async_trait]
impl TenantResolver for StaticTenantResolver {
    async fn current_tenant(&self) -> Result<TenantId, TenantError> {
        Ok(self.tenant.clone())
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::TenantId;

/// An account boundary for API keys, idempotency scope and suppression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub api_key_hash: String,
    pub rate_limit_per_sec: u32,
    pub active: bool,
}

/// The slice of a tenant the pipeline reads for routing and auditing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRef {
    pub id: TenantId,
    pub name: String,
}

impl From<&Tenant> for TenantRef {
    fn from(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id.clone(),
            name: tenant.name.clone(),
        }
    }
}

/// An address a tenant must never send to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub tenant_id: TenantId,
    pub email: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

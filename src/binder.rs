use crate::auth::AuthorizationRecord;
use crate::scoped::ScopedHandler;
use crate::tenant::TenantRegistry;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindError {
    #[error("authorization does not name a tenant")]
    MissingTenant,
    #[error("no such tenant: {0}")]
    NoSuchTenant(String),
}

/// Turns an authorization record into a handler bound to its tenant
pub struct SessionBinder {
    registry: Arc<dyn TenantRegistry>,
    global_read_only: bool,
}

impl SessionBinder {
    pub fn new(registry: Arc<dyn TenantRegistry>, global_read_only: bool) -> Self {
        Self {
            registry,
            global_read_only,
        }
    }

    pub async fn bind(&self, record: &AuthorizationRecord) -> Result<ScopedHandler, BindError> {
        let tenant_id = record.tenant_id();
        if tenant_id.is_empty() {
            return Err(BindError::MissingTenant);
        }

        let Some(fs) = self.registry.find(tenant_id).await else {
            warn!(
                tenant = %tenant_id,
                username = %record.username(),
                "Authorized tenant is not present on this gateway"
            );
            return Err(BindError::NoSuchTenant(tenant_id.to_string()));
        };

        let handler = ScopedHandler::new(record, fs, self.global_read_only);
        debug!(
            tenant = %tenant_id,
            username = %record.username(),
            read_only = handler.is_read_only(),
            "Bound session to tenant"
        );
        Ok(handler)
    }
}

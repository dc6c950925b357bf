//! Tenant lookup.
//!
//! The gateway only ever asks one question of the registry: given a tenant
//! id, which filesystem handle serves it right now.

use crate::backend::{Backend, LocalBackend};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Shared handle to one tenant's file tree
pub type TenantFs = Arc<dyn Backend>;

#[async_trait]
pub trait TenantRegistry: Send + Sync + 'static {
    /// Return the live filesystem handle for `tenant_id`, if any
    async fn find(&self, tenant_id: &str) -> Option<TenantFs>;
}

/// Tenant ids double as directory names, so only a conservative
/// character set is accepted.
pub fn is_valid_tenant_id(tenant_id: &str) -> bool {
    !tenant_id.is_empty()
        && tenant_id.len() <= 128
        && tenant_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Tenants laid out as `<base>/<tenant-id>/` on local disk
pub struct DirectoryRegistry {
    base: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl TenantRegistry for DirectoryRegistry {
    async fn find(&self, tenant_id: &str) -> Option<TenantFs> {
        if !is_valid_tenant_id(tenant_id) {
            debug!(tenant = %tenant_id, "Rejecting malformed tenant id");
            return None;
        }

        let root = self.base.join(tenant_id);
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Some(Arc::new(LocalBackend::new(root))),
            _ => None,
        }
    }
}

/// Fixed id → filesystem map
#[derive(Default)]
pub struct StaticRegistry {
    tenants: HashMap<String, TenantFs>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(self, tenant_id: impl Into<String>, fs: impl Backend) -> Self {
        self.with_shared(tenant_id, Arc::new(fs))
    }

    /// Register a handle that is also held elsewhere
    pub fn with_shared(mut self, tenant_id: impl Into<String>, fs: TenantFs) -> Self {
        self.tenants.insert(tenant_id.into(), fs);
        self
    }
}

#[async_trait]
impl TenantRegistry for StaticRegistry {
    async fn find(&self, tenant_id: &str) -> Option<TenantFs> {
        self.tenants.get(tenant_id).cloned()
    }
}

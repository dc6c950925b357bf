//! Permission- and tenant-bound file access for one authenticated connection.

use crate::auth::{AuthorizationRecord, Permission, PermissionSet};
use crate::backend::{normalize_path, BackendError, BackendResult, DirEntry, FileInfo};
use crate::tenant::TenantFs;
use bytes::Bytes;
use std::fmt;
use tracing::debug;

/// Filesystem commands that are neither reads, writes nor listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCommand {
    Stat(String),
    SetStat(String),
    MakeDir(String),
    RemoveDir(String),
    Remove(String),
    Rename { from: String, to: String },
}

impl FileCommand {
    fn required(&self) -> Permission {
        match self {
            Self::Stat(_) => Permission::List,
            Self::SetStat(_) | Self::MakeDir(_) | Self::Rename { .. } => Permission::Write,
            Self::RemoveDir(_) | Self::Remove(_) => Permission::Delete,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Done,
    Attrs(FileInfo),
}

/// The object the protocol engine talks to.
///
/// Bound to exactly one tenant's filesystem for its whole life. Every
/// capability checks the permission set and the effective read-only flag
/// itself, and every path is normalized against the tenant root before it
/// reaches the filesystem handle.
pub struct ScopedHandler {
    tenant_id: String,
    username: String,
    fs: TenantFs,
    permissions: PermissionSet,
    read_only: bool,
}

impl fmt::Debug for ScopedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedHandler")
            .field("tenant_id", &self.tenant_id)
            .field("username", &self.username)
            .field("permissions", &self.permissions)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl ScopedHandler {
    pub fn new(record: &AuthorizationRecord, fs: TenantFs, global_read_only: bool) -> Self {
        let permissions = record.permissions().clone();
        let read_only = global_read_only || !permissions.allows(Permission::Write);
        Self {
            tenant_id: record.tenant_id().to_string(),
            username: record.username().to_string(),
            fs,
            permissions,
            read_only,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn can(&self, permission: Permission) -> bool {
        let mutating = matches!(permission, Permission::Write | Permission::Delete);
        self.permissions.allows(permission) && !(mutating && self.read_only)
    }

    fn require(&self, permission: Permission, path: &str) -> BackendResult<()> {
        if self.can(permission) {
            Ok(())
        } else {
            debug!(
                tenant = %self.tenant_id,
                username = %self.username,
                ?permission,
                path,
                "Denied file operation"
            );
            Err(BackendError::PermissionDenied)
        }
    }

    /// Normalize a mutation target, refusing the tenant root itself
    fn target(path: &str) -> BackendResult<String> {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return Err(BackendError::PermissionDenied);
        }
        Ok(normalized)
    }

    pub async fn retrieve_file(&self, path: &str) -> BackendResult<Bytes> {
        self.require(Permission::Read, path)?;
        self.fs.read_file(&normalize_path(path)).await
    }

    /// Checks made when a file is opened for writing, before any data arrives
    pub fn check_store(&self, path: &str) -> BackendResult<String> {
        self.require(Permission::Write, path)?;
        Self::target(path)
    }

    pub async fn store_file(&self, path: &str, content: Bytes) -> BackendResult<()> {
        let target = self.check_store(path)?;
        debug!(tenant = %self.tenant_id, path = %target, len = content.len(), "Storing file");
        self.fs.write_file(&target, content).await
    }

    pub async fn list_directory(&self, path: &str) -> BackendResult<Vec<DirEntry>> {
        self.require(Permission::List, path)?;
        self.fs.list_dir(&normalize_path(path)).await
    }

    pub async fn command(&self, command: FileCommand) -> BackendResult<CommandOutcome> {
        let required = command.required();
        let subject = match &command {
            FileCommand::Stat(p)
            | FileCommand::SetStat(p)
            | FileCommand::MakeDir(p)
            | FileCommand::RemoveDir(p)
            | FileCommand::Remove(p) => p.as_str(),
            FileCommand::Rename { from, .. } => from.as_str(),
        };
        self.require(required, subject)?;

        match command {
            FileCommand::Stat(path) => {
                let info = self.fs.file_info(&normalize_path(&path)).await?;
                Ok(CommandOutcome::Attrs(info))
            }
            FileCommand::SetStat(path) => {
                // Attributes are not persisted; the target only has to exist.
                self.fs.file_info(&normalize_path(&path)).await?;
                Ok(CommandOutcome::Done)
            }
            FileCommand::MakeDir(path) => {
                let target = Self::target(&path)?;
                debug!(tenant = %self.tenant_id, path = %target, "Creating directory");
                self.fs.make_dir(&target).await?;
                Ok(CommandOutcome::Done)
            }
            FileCommand::RemoveDir(path) => {
                let target = Self::target(&path)?;
                debug!(tenant = %self.tenant_id, path = %target, "Removing directory");
                self.fs.del_dir(&target).await?;
                Ok(CommandOutcome::Done)
            }
            FileCommand::Remove(path) => {
                let target = Self::target(&path)?;
                debug!(tenant = %self.tenant_id, path = %target, "Removing file");
                self.fs.delete(&target).await?;
                Ok(CommandOutcome::Done)
            }
            FileCommand::Rename { from, to } => {
                let from = Self::target(&from)?;
                let to = Self::target(&to)?;
                debug!(tenant = %self.tenant_id, from = %from, to = %to, "Renaming");
                self.fs.rename(&from, &to).await?;
                Ok(CommandOutcome::Done)
            }
        }
    }
}

//! Credential delegation.
//!
//! Passwords are never checked locally. Each attempt is forwarded to an
//! [`IdentityAuthority`] and the answer is shaped into an
//! [`AuthorizationRecord`] naming the tenant and the permission tokens the
//! session is granted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub mod fixed;
pub mod http;

pub use fixed::{FixedAccount, FixedAuthority};
pub use http::{HttpAuthority, HttpAuthorityConfig};

/// Password attempts allowed on one connection
pub const MAX_AUTH_ATTEMPTS: usize = 6;

/// Token that grants every permission
pub const WILDCARD: &str = "*";

/// Capability a permission token can grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// List directories and stat entries
    List,
    /// Read file contents
    Read,
    /// Create and modify files and directories
    Write,
    /// Remove files and directories
    Delete,
}

impl Permission {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "list" | "file.read" => Some(Self::List),
            "read" | "file.read-content" => Some(Self::Read),
            "write" | "file.create" | "file.update" => Some(Self::Write),
            "delete" | "file.delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Ordered permission tokens as returned by the authority.
///
/// Tokens the gateway does not understand are kept (so the record
/// round-trips) but grant nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    tokens: Vec<String>,
}

impl PermissionSet {
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Vec::new();
        for token in tokens {
            let token = token.as_ref().trim();
            if !token.is_empty() && !set.iter().any(|t: &String| t == token) {
                set.push(token.to_string());
            }
        }
        Self { tokens: set }
    }

    /// Parse the comma-joined form
    pub fn parse(joined: &str) -> Self {
        Self::from_tokens(joined.split(','))
    }

    pub fn allows(&self, permission: Permission) -> bool {
        self.tokens
            .iter()
            .any(|t| t == WILDCARD || Permission::from_token(t) == Some(permission))
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Comma-joined form, as carried on the connection
    pub fn joined(&self) -> String {
        self.tokens.join(",")
    }
}

/// Outcome of a successful credential check, fixed for the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRecord {
    tenant_id: String,
    username: String,
    permissions: PermissionSet,
}

impl AuthorizationRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        username: impl Into<String>,
        permissions: PermissionSet,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            username: username.into(),
            permissions,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }
}

/// Request body sent to the identity authority
#[derive(Clone, Serialize)]
pub struct CredentialRequest {
    pub user: String,
    pub pass: String,
    pub ip: String,
    pub session_id: String,
    pub client_version: String,
}

impl fmt::Debug for CredentialRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRequest")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("ip", &self.ip)
            .field("session_id", &self.session_id)
            .field("client_version", &self.client_version)
            .finish()
    }
}

/// Successful answer from the identity authority
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialResponse {
    /// Tenant the credentials belong to
    pub server: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("identity authority unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("identity authority unavailable: {0}")]
    AuthorityUnavailable(String),
    #[error("too many authentication attempts")]
    TooManyAttempts,
}

/// External service of record for username/password pairs
#[async_trait]
pub trait IdentityAuthority: Send + Sync + 'static {
    async fn validate(
        &self,
        request: &CredentialRequest,
    ) -> Result<CredentialResponse, AuthorityError>;
}

/// Per-connection front to the identity authority, enforcing the attempt cap
pub struct CredentialGate {
    authority: Arc<dyn IdentityAuthority>,
    attempts: usize,
    max_attempts: usize,
}

impl CredentialGate {
    pub fn new(authority: Arc<dyn IdentityAuthority>) -> Self {
        Self {
            authority,
            attempts: 0,
            max_attempts: MAX_AUTH_ATTEMPTS,
        }
    }

    /// Attempts that reached the authority so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub async fn validate(
        &mut self,
        request: CredentialRequest,
    ) -> Result<AuthorizationRecord, AuthError> {
        if self.attempts >= self.max_attempts {
            warn!(
                subsystem = "sftp",
                username = %request.user,
                ip = %request.ip,
                attempts = self.attempts,
                "Authentication attempt limit reached"
            );
            return Err(AuthError::TooManyAttempts);
        }
        self.attempts += 1;

        debug!(
            subsystem = "sftp",
            username = %request.user,
            ip = %request.ip,
            "Validating credentials for SFTP connection"
        );

        match self.authority.validate(&request).await {
            Ok(response) => {
                debug!(
                    subsystem = "sftp",
                    username = %request.user,
                    ip = %request.ip,
                    tenant = %response.server,
                    "Credentials validated and matched to tenant"
                );
                Ok(AuthorizationRecord::new(
                    response.server,
                    request.user,
                    PermissionSet::from_tokens(&response.permissions),
                ))
            }
            Err(AuthorityError::InvalidCredentials) => {
                warn!(
                    subsystem = "sftp",
                    username = %request.user,
                    ip = %request.ip,
                    "Failed to validate user credentials (invalid username or password)"
                );
                Err(AuthError::InvalidCredentials)
            }
            Err(AuthorityError::Unavailable(reason)) => {
                error!(
                    subsystem = "sftp",
                    username = %request.user,
                    ip = %request.ip,
                    error = %reason,
                    "Encountered an error while trying to validate user credentials"
                );
                Err(AuthError::AuthorityUnavailable(reason))
            }
        }
    }
}

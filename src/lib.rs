//! # tenant-sftp
//!
//! A multi-tenant SFTP gateway. Passwords are checked by an external
//! identity authority which names the tenant and the permissions of each
//! login; every SFTP channel is then served from that tenant's file tree
//! only.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tenant_sftp::auth::{FixedAccount, FixedAuthority};
//! use tenant_sftp::{DirectoryRegistry, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> tenant_sftp::Result<()> {
//!     let account = "bob:secret:tenant-42:list+read".parse::<FixedAccount>();
//!     let authority = FixedAuthority::new(account.into_iter().collect());
//!
//!     Server::new(authority, DirectoryRegistry::new("/srv/sftp"))
//!         .config(ServerConfig::new().port(2022).base_path("/srv/sftp"))
//!         .run()
//!         .await
//! }
//! ```
//!
//! ## Custom identity authority
//!
//! ```rust,ignore
//! use tenant_sftp::auth::{AuthorityError, CredentialRequest, CredentialResponse, IdentityAuthority};
//! use async_trait::async_trait;
//!
//! struct Ldap;
//!
//! #[async_trait]
//! impl IdentityAuthority for Ldap {
//!     async fn validate(&self, request: &CredentialRequest) -> Result<CredentialResponse, AuthorityError> {
//!         // Look the user up and name their tenant
//!         todo!()
//!     }
//! }
//! ```

pub mod auth;
pub mod backend;
pub mod binder;
pub mod error;
pub mod handle;
pub mod identity;
pub mod scoped;
pub mod server;
pub mod sftp_handler;
pub mod ssh_handler;
pub mod tenant;
pub mod transport;

// Re-exports for convenience
pub use auth::{AuthorizationRecord, CredentialGate, IdentityAuthority, PermissionSet};
pub use backend::local::LocalBackend;
pub use backend::memory::MemoryBackend;
pub use backend::{Backend, BackendError, BackendResult, DirEntry, FileInfo};
pub use binder::{BindError, SessionBinder};
pub use identity::{ensure_identity, ServerIdentity};
pub use scoped::ScopedHandler;
pub use ssh_handler::ChannelRouter;
pub use tenant::{DirectoryRegistry, StaticRegistry, TenantRegistry};

pub use error::{Error, Result};
pub use server::{Server, ServerConfig};

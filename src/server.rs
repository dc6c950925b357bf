use crate::auth::{CredentialGate, IdentityAuthority, MAX_AUTH_ATTEMPTS};
use crate::binder::SessionBinder;
use crate::identity::{ensure_identity, ServerIdentity};
use crate::ssh_handler::{ChannelRouter, ConnectionInfo};
use crate::tenant::TenantRegistry;
use crate::transport::IdentCapture;
use russh::server::Config as SshConfig;
use russh::{MethodKind, MethodSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pause after a failed accept so a descriptor shortage does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listener configuration, fixed once the server starts
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_address: String,
    /// Port to bind to
    pub port: u16,
    /// Root of the tenant directories and of the host key
    pub base_path: PathBuf,
    /// Refuse every mutation regardless of granted permissions
    pub read_only: bool,
    /// Delay before answering a failed authentication attempt
    pub auth_rejection_time: Duration,
    /// Drop connections that stay silent this long
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 2022,
            base_path: PathBuf::from("."),
            read_only: false,
            auth_rejection_time: Duration::from_secs(3),
            idle_timeout: None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = path.into();
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn auth_rejection_time(mut self, delay: Duration) -> Self {
        self.auth_rejection_time = delay;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Transport settings: password auth only, attempt cap, host key
    pub fn ssh_config(&self, identity: &ServerIdentity) -> SshConfig {
        SshConfig {
            auth_rejection_time: self.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods: MethodSet::from(&[MethodKind::Password][..]),
            max_auth_attempts: MAX_AUTH_ATTEMPTS,
            inactivity_timeout: self.idle_timeout,
            keys: vec![identity.key().clone()],
            ..Default::default()
        }
    }
}

/// SFTP gateway: accepts connections and runs one [`ChannelRouter`] per
/// connection.
pub struct Server {
    authority: Arc<dyn IdentityAuthority>,
    registry: Arc<dyn TenantRegistry>,
    config: ServerConfig,
}

impl Server {
    pub fn new(authority: impl IdentityAuthority, registry: impl TenantRegistry) -> Self {
        Self::with_shared(Arc::new(authority), Arc::new(registry))
    }

    pub fn with_shared(
        authority: Arc<dyn IdentityAuthority>,
        registry: Arc<dyn TenantRegistry>,
    ) -> Self {
        Self {
            authority,
            registry,
            config: ServerConfig::default(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bootstrap the host identity, bind the listener and serve forever.
    ///
    /// Identity and bind failures are returned before anything is accepted.
    pub async fn run(self) -> crate::Result<()> {
        let identity = ensure_identity(&self.config.base_path).await?;

        let addr = (self.config.bind_address.as_str(), self.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            read_only = self.config.read_only,
            "SFTP gateway listening"
        );

        self.serve(listener, identity).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(self, listener: TcpListener, identity: ServerIdentity) -> crate::Result<()> {
        let ssh_config = Arc::new(self.config.ssh_config(&identity));
        let binder = Arc::new(SessionBinder::new(self.registry, self.config.read_only));

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(error = %err, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            tokio::spawn(handle_connection(
                ssh_config.clone(),
                socket,
                peer,
                self.authority.clone(),
                binder.clone(),
            ));
        }
    }
}

async fn handle_connection(
    ssh_config: Arc<SshConfig>,
    socket: TcpStream,
    peer: SocketAddr,
    authority: Arc<dyn IdentityAuthority>,
    binder: Arc<SessionBinder>,
) {
    let (stream, client_version) = IdentCapture::new(socket);
    let info = ConnectionInfo {
        peer: Some(peer),
        session_id: Uuid::new_v4().to_string(),
        client_version,
    };
    debug!(peer = %peer, session_id = %info.session_id, "New SSH connection");

    let router = ChannelRouter::new(info, CredentialGate::new(authority), binder);
    match russh::server::run_stream(ssh_config, stream, router).await {
        Ok(session) => match session.await {
            Ok(()) => debug!(peer = %peer, "SSH session ended"),
            Err(err) => warn!(peer = %peer, error = %err, "SSH session ended with error"),
        },
        Err(err) => warn!(peer = %peer, error = %err, "SSH handshake failed"),
    }
}

//! Per-connection SSH handler.
//!
//! A [`ChannelRouter`] is created for every accepted connection. It runs
//! password authentication through the connection's [`CredentialGate`],
//! keeps the resulting [`AuthorizationRecord`] for the life of the
//! connection, and only ever hands `session` channels that request the
//! `sftp` subsystem to the protocol engine.

use crate::auth::{AuthError, AuthorizationRecord, CredentialGate, CredentialRequest};
use crate::binder::{BindError, SessionBinder};
use crate::scoped::ScopedHandler;
use crate::sftp_handler::SftpSession;
use crate::transport::ClientVersion;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The only channel type served
pub const SESSION_CHANNEL: &str = "session";

/// The only subsystem served on a session channel
pub const SFTP_SUBSYSTEM: &str = "sftp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    AwaitingAuth,
    Authenticated,
    /// At least one channel has been bound to the tenant
    Routing,
    /// Authentication was abandoned; nothing more is accepted
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownChannelType,
    NotAuthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDecision {
    Accept,
    Reject(RejectReason),
}

/// What is known about the peer before authentication
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: Option<SocketAddr>,
    pub session_id: String,
    pub client_version: ClientVersion,
}

impl ConnectionInfo {
    fn ip(&self) -> String {
        self.peer.map(|p| p.to_string()).unwrap_or_default()
    }
}

pub struct ChannelRouter {
    info: ConnectionInfo,
    gate: CredentialGate,
    binder: Arc<SessionBinder>,
    state: RouterState,
    authorization: Option<Arc<AuthorizationRecord>>,
    scoped: Option<Arc<ScopedHandler>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ChannelRouter {
    pub fn new(info: ConnectionInfo, gate: CredentialGate, binder: Arc<SessionBinder>) -> Self {
        Self {
            info,
            gate,
            binder,
            state: RouterState::AwaitingAuth,
            authorization: None,
            scoped: None,
            channels: HashMap::new(),
        }
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn authorization(&self) -> Option<&AuthorizationRecord> {
        self.authorization.as_deref()
    }

    /// Run one password attempt through the gate.
    ///
    /// Rejections carry no detail. `Err` means the attempt cap was hit and
    /// the handshake must end.
    pub async fn authenticate(&mut self, user: &str, password: &str) -> Result<Auth, AuthError> {
        if self.authorization.is_some() {
            return Ok(Auth::Accept);
        }

        let request = CredentialRequest {
            user: user.to_string(),
            pass: password.to_string(),
            ip: self.info.ip(),
            session_id: self.info.session_id.clone(),
            client_version: self.info.client_version.get().cloned().unwrap_or_default(),
        };

        match self.gate.validate(request).await {
            Ok(record) => {
                info!(
                    subsystem = "sftp",
                    username = %record.username(),
                    ip = %self.info.ip(),
                    tenant = %record.tenant_id(),
                    permissions = %record.permissions().joined(),
                    "Password authentication successful"
                );
                self.authorization = Some(Arc::new(record));
                self.state = RouterState::Authenticated;
                Ok(Auth::Accept)
            }
            Err(AuthError::TooManyAttempts) => {
                self.state = RouterState::Closed;
                Err(AuthError::TooManyAttempts)
            }
            Err(_) => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    pub fn route_channel_open(&self, kind: &str) -> ChannelDecision {
        let decision = if self.authorization.is_none() || self.state == RouterState::Closed {
            ChannelDecision::Reject(RejectReason::NotAuthenticated)
        } else if kind != SESSION_CHANNEL {
            ChannelDecision::Reject(RejectReason::UnknownChannelType)
        } else {
            ChannelDecision::Accept
        };

        if let ChannelDecision::Reject(reason) = decision {
            debug!(kind, ?reason, peer = ?self.info.peer, "Rejecting channel open");
        }
        decision
    }

    pub fn accepts_subsystem(name: &str) -> bool {
        name == SFTP_SUBSYSTEM
    }

    /// Handler shared by every SFTP channel of this connection, bound on
    /// first use. A failed bind is not remembered.
    pub async fn scoped_handler(&mut self) -> Result<Arc<ScopedHandler>, BindError> {
        if let Some(scoped) = &self.scoped {
            return Ok(scoped.clone());
        }

        let record = self
            .authorization
            .as_ref()
            .filter(|r| !r.tenant_id().is_empty())
            .ok_or(BindError::MissingTenant)?;
        let scoped = Arc::new(self.binder.bind(record).await?);

        self.scoped = Some(scoped.clone());
        self.state = RouterState::Routing;
        Ok(scoped)
    }

    /// The transport only sends the failure if the peer asked for a reply
    fn refuse_request(
        &self,
        channel_id: ChannelId,
        request: &str,
        session: &mut Session,
    ) -> Result<(), crate::Error> {
        debug!(channel_id = ?channel_id, request, "Refusing channel request");
        session.channel_failure(channel_id)?;
        Ok(())
    }
}

impl russh::server::Handler for ChannelRouter {
    type Error = crate::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.authenticate(user, password).await?)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.route_channel_open(SESSION_CHANNEL) != ChannelDecision::Accept {
            return Ok(false);
        }
        debug!(channel_id = ?channel.id(), "Opening session channel");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.route_channel_open("direct-tcpip") == ChannelDecision::Accept)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_request(channel, "pty-req", session)
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_request(channel, "x11-req", session)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_request(channel, "window-change", session)
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        _signal: russh::Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_request(channel, "signal", session)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_request(channel, "env", session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_request(channel, "shell", session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_request(channel, "exec", session)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !Self::accepts_subsystem(name) {
            return self.refuse_request(channel_id, "subsystem", session);
        }
        // A channel runs at most one subsystem
        let Some(channel) = self.channels.remove(&channel_id) else {
            return self.refuse_request(channel_id, "subsystem", session);
        };

        let scoped = match self.scoped_handler().await {
            Ok(scoped) => scoped,
            Err(error) => {
                warn!(
                    subsystem = "sftp",
                    channel_id = ?channel_id,
                    peer = ?self.info.peer,
                    %error,
                    "Could not bind channel to a tenant"
                );
                session.channel_failure(channel_id)?;
                session.close(channel_id)?;
                return Ok(());
            }
        };

        session.channel_success(channel_id)?;
        debug!(
            subsystem = "sftp",
            channel_id = ?channel_id,
            tenant = %scoped.tenant_id(),
            "Starting SFTP session"
        );
        let sftp = SftpSession::new(scoped, format!("{:?}", channel_id));
        russh_sftp::server::run(channel.into_stream(), sftp).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel_id = ?channel_id, "Channel EOF");
        session.close(channel_id)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        debug!(channel_id = ?channel_id, "Channel closed");
        Ok(())
    }
}

impl Drop for ChannelRouter {
    fn drop(&mut self) {
        debug!(
            peer = ?self.info.peer,
            session_id = %self.info.session_id,
            state = ?self.state,
            open_channels = self.channels.len(),
            "Connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::CountingAuthority;
    use crate::auth::MAX_AUTH_ATTEMPTS;
    use crate::backend::MemoryBackend;
    use crate::tenant::StaticRegistry;
    use std::sync::atomic::Ordering;

    fn router(authority: Arc<CountingAuthority>) -> ChannelRouter {
        let registry = StaticRegistry::new().with_tenant("tenant-42", MemoryBackend::new());
        let binder = Arc::new(SessionBinder::new(Arc::new(registry), false));
        let info = ConnectionInfo {
            peer: "192.0.2.10:50022".parse().ok(),
            session_id: "0b7e0d3a".into(),
            client_version: ClientVersion::default(),
        };
        ChannelRouter::new(info, CredentialGate::new(authority), binder)
    }

    fn accepting(tenant: &'static str) -> Arc<CountingAuthority> {
        Arc::new(CountingAuthority::accepting(
            "correct",
            tenant,
            vec!["list", "read"],
        ))
    }

    #[tokio::test]
    async fn test_login_transitions_to_authenticated() {
        let mut router = router(accepting("tenant-42"));
        assert_eq!(router.state(), RouterState::AwaitingAuth);

        for _ in 0..3 {
            let auth = router.authenticate("bob", "wrong").await.unwrap();
            assert!(matches!(auth, Auth::Reject { .. }));
            assert_eq!(router.state(), RouterState::AwaitingAuth);
        }

        let auth = router.authenticate("bob", "correct").await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(router.state(), RouterState::Authenticated);

        let record = router.authorization().unwrap();
        assert_eq!(record.tenant_id(), "tenant-42");
        assert_eq!(record.username(), "bob");
        assert_eq!(record.permissions().joined(), "list,read");
    }

    #[tokio::test]
    async fn test_attempt_cap_ends_handshake() {
        let authority = accepting("tenant-42");
        let mut router = router(authority.clone());

        for _ in 0..MAX_AUTH_ATTEMPTS {
            assert!(router.authenticate("bob", "wrong").await.is_ok());
        }
        assert!(matches!(
            router.authenticate("bob", "correct").await,
            Err(AuthError::TooManyAttempts)
        ));
        assert_eq!(router.state(), RouterState::Closed);
        assert_eq!(authority.calls.load(Ordering::SeqCst), MAX_AUTH_ATTEMPTS);
        assert_eq!(
            router.route_channel_open(SESSION_CHANNEL),
            ChannelDecision::Reject(RejectReason::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn test_authority_outage_is_a_plain_rejection() {
        let mut router = router(Arc::new(CountingAuthority::broken("timeout")));
        let auth = router.authenticate("bob", "correct").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(router.authorization().is_none());
    }

    #[tokio::test]
    async fn test_channel_types() {
        let mut router = router(accepting("tenant-42"));
        assert_eq!(
            router.route_channel_open(SESSION_CHANNEL),
            ChannelDecision::Reject(RejectReason::NotAuthenticated)
        );

        router.authenticate("bob", "correct").await.unwrap();
        assert_eq!(
            router.route_channel_open("shell"),
            ChannelDecision::Reject(RejectReason::UnknownChannelType)
        );
        assert_eq!(
            router.route_channel_open("direct-tcpip"),
            ChannelDecision::Reject(RejectReason::UnknownChannelType)
        );
        // The rejection leaves the connection usable
        assert_eq!(router.route_channel_open(SESSION_CHANNEL), ChannelDecision::Accept);
        assert_eq!(router.state(), RouterState::Authenticated);
    }

    #[test]
    fn test_only_sftp_subsystem() {
        assert!(ChannelRouter::accepts_subsystem("sftp"));
        assert!(!ChannelRouter::accepts_subsystem("SFTP"));
        assert!(!ChannelRouter::accepts_subsystem("netconf"));
        assert!(!ChannelRouter::accepts_subsystem(""));
    }

    #[tokio::test]
    async fn test_channels_share_one_bound_handler() {
        let mut router = router(accepting("tenant-42"));
        assert_eq!(
            router.scoped_handler().await.unwrap_err(),
            BindError::MissingTenant
        );

        router.authenticate("bob", "correct").await.unwrap();
        let first = router.scoped_handler().await.unwrap();
        let second = router.scoped_handler().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.tenant_id(), "tenant-42");
        assert!(first.is_read_only());
        assert_eq!(router.state(), RouterState::Routing);
    }

    #[tokio::test]
    async fn test_removed_tenant_refuses_channel_only() {
        let mut router = router(accepting("tenant-99"));
        router.authenticate("bob", "correct").await.unwrap();

        assert_eq!(
            router.scoped_handler().await.unwrap_err(),
            BindError::NoSuchTenant("tenant-99".into())
        );
        assert_eq!(router.state(), RouterState::Authenticated);
        assert_eq!(router.route_channel_open(SESSION_CHANNEL), ChannelDecision::Accept);
    }
}

//! Per-session driver task.
//!
//! Consumes the session's inbound queue in order and walks the session
//! through the join handshake: identity capture, the credential exchange
//! with the client, the login veto, and the replayed handshake against the
//! chosen backend. Once active it relays traffic in both directions.

use super::{BackendLink, PendingBackend, ProxySession, SessionInput, SessionState};
use crate::config::BackendConfig;
use crate::context::ProxyContext;
use crate::error::{ProxyError, ProxyResult};
use crate::stats;
use hyproxy_core::event::{
    EventKind, PostLoginEvent, ServerConnectedEvent, ServerPreConnectEvent, ServerResult,
};
use hyproxy_core::packets::{AuthGrant, AuthToken, Connect};
use hyproxy_core::{Direction, Intercept, Packet, PacketContext, PlayerIdentity, TaskHandle};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client packets buffered while the backend is being established.
const MAX_HELD_PACKETS: usize = 512;

/// Connect `session` to `backend` and replay its handshake there.
///
/// The link is parked as the session's pending backend until the backend
/// accepts the player; the driver then promotes it. `done` is resolved
/// with the outcome.
pub(crate) async fn open_backend(
    ctx: &ProxyContext,
    session: &Arc<ProxySession>,
    backend: &BackendConfig,
    done: Option<oneshot::Sender<Result<(), String>>>,
) -> ProxyResult<Arc<BackendLink>> {
    let handshake = session
        .with_auth(|auth| auth.handshake.clone())
        .ok_or_else(|| ProxyError::Other("no handshake to replay".into()))?;

    let link = tokio::time::timeout(
        ctx.config.connection_timeout,
        ctx.connector.connect(session, backend),
    )
    .await
    .map_err(|_| ProxyError::Timeout)??;

    session.set_pending(match done {
        Some(done) => PendingBackend::with_notify(link.clone(), done),
        None => PendingBackend::new(link.clone()),
    });
    if let Err(e) = link.send(handshake.into()) {
        abandon_pending(session, link.id(), &e.to_string());
        return Err(e);
    }
    debug!(session = session.id(), backend = %backend.name, link = link.id(), "handshake replayed");
    Ok(link)
}

/// Abandon the pending backend if it is still `link`. Returns whether it was.
pub(crate) fn abandon_pending(session: &ProxySession, link: u64, reason: &str) -> bool {
    if session.pending_link().map(|l| l.id()) != Some(link) {
        return false;
    }
    match session.take_pending() {
        Some(pending) => {
            pending.abandon(reason);
            true
        }
        None => false,
    }
}

pub struct SessionDriver {
    ctx: Arc<ProxyContext>,
    session: Arc<ProxySession>,
    inbound: mpsc::UnboundedReceiver<SessionInput>,
    held: VecDeque<Packet>,
    connect_deadline: Option<TaskHandle>,
    dialing_since: Option<Instant>,
}

impl SessionDriver {
    pub fn new(
        ctx: Arc<ProxyContext>,
        session: Arc<ProxySession>,
        inbound: mpsc::UnboundedReceiver<SessionInput>,
    ) -> Self {
        Self {
            ctx,
            session,
            inbound,
            held: VecDeque::new(),
            connect_deadline: None,
            dialing_since: None,
        }
    }

    /// Run until the session is torn down.
    pub async fn run(mut self) {
        let shutdown = self.session.shutdown_token();
        loop {
            let input = tokio::select! {
                _ = shutdown.cancelled() => break,
                input = self.inbound.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            if let Err(e) = self.handle(input).await {
                if !self.session.is_closed() {
                    warn!(session = self.session.id(), error = %e, "session error");
                    self.session.fail(&e.to_string());
                }
            }
            if self.session.is_closed() {
                break;
            }
        }
        self.disarm_connect_deadline();
        debug!(session = self.session.id(), state = %self.session.state(), "session driver finished");
    }

    async fn handle(&mut self, input: SessionInput) -> ProxyResult<()> {
        match input {
            SessionInput::Client(packet) => self.on_client(packet).await,
            SessionInput::Backend { link, packet } => self.on_backend(link, packet).await,
            SessionInput::BackendClosed { link, reason } => {
                self.on_backend_closed(link, reason);
                Ok(())
            }
            SessionInput::BackendTimeout { link } => {
                self.on_backend_timeout(link);
                Ok(())
            }
            SessionInput::ClientClosed => {
                self.session.close();
                Ok(())
            }
        }
    }

    async fn on_client(&mut self, packet: Packet) -> ProxyResult<()> {
        match (self.session.state(), packet) {
            (SessionState::CapturingIdentity, Packet::Connect(connect)) => {
                self.on_connect(connect).await
            }
            (SessionState::CapturingIdentity, other) => {
                self.session
                    .fail(&format!("Expected Connect, got {}", other.name()));
                Ok(())
            }
            (_, Packet::Connect(_)) => {
                self.session.fail("Unexpected handshake");
                Ok(())
            }
            (SessionState::ExchangingToken, Packet::AuthToken(token)) => {
                self.on_client_token(token).await
            }
            (SessionState::Active | SessionState::Transferring, packet) => {
                if self.ctx.config.debug {
                    debug!(session = self.session.id(), packet = packet.name(), "client -> backend");
                }
                self.session.send_to_backend(packet).map(|_| ())
            }
            (_, packet) => {
                if self.held.len() >= MAX_HELD_PACKETS {
                    self.session.fail("Too many packets before login completed");
                    return Ok(());
                }
                self.held.push_back(packet);
                Ok(())
            }
        }
    }

    async fn on_connect(&mut self, connect: Connect) -> ProxyResult<()> {
        let identity = PlayerIdentity::from_connect(&connect);
        info!(
            session = self.session.id(),
            player = %identity,
            remote = %self.session.remote_addr(),
            "handshake received"
        );
        self.session.set_identity(identity);
        self.session
            .with_auth(|auth| auth.handshake = Some(connect.clone()));

        match self.ctx.relay.grant_for_client(&self.session, &connect).await {
            Ok(grant) => {
                self.session.transition(SessionState::ExchangingToken)?;
                self.session.send_raw_to_client(grant.into())
            }
            Err(e) => {
                warn!(session = self.session.id(), error = %e, "could not obtain auth grant");
                stats::auth_failed("client_grant");
                self.session.fail(&e.to_string());
                Ok(())
            }
        }
    }

    async fn on_client_token(&mut self, token: AuthToken) -> ProxyResult<()> {
        let reply = match self.ctx.relay.accept_client_token(&self.session, &token).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session = self.session.id(), error = %e, "client token rejected");
                stats::auth_failed("client_token");
                self.session.fail(&e.to_string());
                return Ok(());
            }
        };
        self.session.send_raw_to_client(reply.into())?;

        let Some(handshake) = self.session.with_auth(|auth| auth.handshake.clone()) else {
            return Err(ProxyError::Other("handshake missing".into()));
        };
        let ctx = PacketContext::new(Direction::ClientToServer, self.session.snapshot());
        match self.session.pipeline().process(&ctx, handshake.into()) {
            Intercept::Drop => {
                info!(session = self.session.id(), player = %self.session.identity(), "login denied");
                self.session.disconnect("Login denied");
                return Ok(());
            }
            Intercept::Forward(Packet::Connect(connect)) => {
                self.session.with_auth(|auth| auth.handshake = Some(connect));
            }
            Intercept::Forward(_) => {}
        }

        self.session.transition(SessionState::EstablishingBackend)?;
        self.connect_initial().await
    }

    /// Pick the first backend: a pending referral, else the default.
    fn initial_backend(&self) -> Option<BackendConfig> {
        let config = &self.ctx.config;
        let referred = self.session.with_auth(|auth| {
            auth.handshake
                .as_ref()
                .map(|c| (c.uuid, c.referral_data.clone()))
        });
        referred
            .and_then(|(uuid, data)| self.ctx.referrals.consume(uuid, data.as_deref()))
            .and_then(|name| {
                let found = config.backend_by_name(&name).cloned();
                if found.is_none() {
                    warn!(session = self.session.id(), backend = %name, "referral names an unknown backend");
                }
                found
            })
            .or_else(|| config.default_backend().cloned())
    }

    async fn connect_initial(&mut self) -> ProxyResult<()> {
        let Some(original) = self.initial_backend() else {
            self.session.disconnect("No server available");
            return Ok(());
        };

        let event = ServerPreConnectEvent::new(self.session.id(), self.session.identity(), &original.name);
        let fired = self.ctx.dispatcher().fire_sync(event.into());
        let result = ServerPreConnectEvent::from_event(fired)
            .map(|e| e.result)
            .unwrap_or_else(|| ServerResult::Allowed(original.name.clone()));

        let backend = match result {
            ServerResult::Denied(reason) => {
                let reason = reason.unwrap_or_else(|| "Connection denied".to_string());
                self.session.disconnect(&reason);
                return Ok(());
            }
            ServerResult::Allowed(name) if name.eq_ignore_ascii_case(&original.name) => original,
            ServerResult::Allowed(name) => match self.ctx.config.backend_by_name(&name) {
                Some(backend) => {
                    debug!(session = self.session.id(), from = %original.name, to = %name, "pre-connect redirect");
                    backend.clone()
                }
                None => {
                    self.session.disconnect(&format!("Unknown server {name}"));
                    return Ok(());
                }
            },
        };

        let started = Instant::now();
        self.dialing_since = Some(started);
        match open_backend(&self.ctx, &self.session, &backend, None).await {
            Ok(link) => self.arm_connect_deadline(link.id(), started),
            Err(e) => {
                warn!(session = self.session.id(), backend = %backend.name, error = %e, "backend connect failed");
                stats::backend_failed(&backend.name);
                self.ctx.health.record(&backend.name, false);
                let reason = match e {
                    ProxyError::Timeout => format!("Timed out connecting to {}", backend.name),
                    _ => format!("Could not connect to {}", backend.name),
                };
                self.session.disconnect(&reason);
            }
        }
        Ok(())
    }

    /// Bound the whole initial connect, backend handshake included, by the
    /// connection timeout counted from `started`.
    fn arm_connect_deadline(&mut self, link: u64, started: Instant) {
        let remaining = (started + self.ctx.config.connection_timeout).saturating_duration_since(Instant::now());
        let inbound = self.session.inbound();
        let owner = format!("session-{}", self.session.id());
        let handle = self.ctx.scheduler.run_later(&owner, remaining, async move {
            let _ = inbound.send(SessionInput::BackendTimeout { link });
        });
        if let Some(previous) = self.connect_deadline.replace(handle) {
            previous.cancel();
        }
    }

    fn disarm_connect_deadline(&mut self) {
        if let Some(deadline) = self.connect_deadline.take() {
            deadline.cancel();
        }
    }

    fn on_backend_timeout(&mut self, link: u64) {
        let Some(pending) = self.session.pending_link().filter(|l| l.id() == link) else {
            return;
        };
        warn!(session = self.session.id(), backend = %pending.name(), "backend did not accept the player in time");
        self.pending_failed(link, &format!("Timed out connecting to {}", pending.name()));
    }

    async fn on_backend(&mut self, link: u64, packet: Packet) -> ProxyResult<()> {
        if let Some(pending) = self.session.pending_link().filter(|l| l.id() == link) {
            return self.on_pending_packet(pending, packet).await;
        }
        if self.session.backend().map(|l| l.id()) != Some(link) {
            debug!(session = self.session.id(), link, packet = packet.name(), "dropping packet from stale backend link");
            return Ok(());
        }

        match packet {
            Packet::Disconnect(disconnect) => {
                if self.session.pending_link().is_some() {
                    info!(session = self.session.id(), "old backend disconnected during transfer");
                    return Ok(());
                }
                self.session.close_by_backend(disconnect.reason);
                Ok(())
            }
            packet => {
                if let Packet::Ping(ping) = &packet {
                    if ping.last_ping_raw >= 0 {
                        self.session.set_ping_ms(ping.last_ping_raw);
                    }
                }
                if self.ctx.config.debug {
                    debug!(session = self.session.id(), packet = packet.name(), "backend -> client");
                }
                self.session.send_to_client(packet).map(|_| ())
            }
        }
    }

    async fn on_pending_packet(&mut self, link: Arc<BackendLink>, packet: Packet) -> ProxyResult<()> {
        match packet {
            Packet::AuthGrant(grant) => self.on_backend_grant(link, grant).await,
            Packet::ServerAuthToken(token) => {
                if token.password_challenge.as_ref().is_some_and(|c| !c.is_empty()) {
                    warn!(session = self.session.id(), backend = %link.name(), "backend requested a password, ignoring");
                }
                self.promote_pending(link.id()).await
            }
            Packet::ConnectAccept(accept) => {
                if accept.password_challenge.as_ref().is_some_and(|c| !c.is_empty()) {
                    warn!(session = self.session.id(), backend = %link.name(), "backend requested a password, ignoring");
                }
                self.promote_pending(link.id()).await
            }
            Packet::Disconnect(disconnect) => {
                let reason = disconnect
                    .reason
                    .unwrap_or_else(|| format!("Disconnected by {}", link.name()));
                info!(session = self.session.id(), backend = %link.name(), reason = %reason, "backend refused player");
                self.pending_failed(link.id(), &reason);
                Ok(())
            }
            other => {
                debug!(session = self.session.id(), packet = other.name(), "ignoring packet before backend accepted player");
                Ok(())
            }
        }
    }

    async fn on_backend_grant(&mut self, link: Arc<BackendLink>, grant: AuthGrant) -> ProxyResult<()> {
        match self.ctx.relay.answer_backend_grant(&self.session, &grant).await {
            Ok(token) => {
                if let Err(e) = link.send(token.into()) {
                    self.pending_failed(link.id(), &e.to_string());
                }
            }
            Err(e) => {
                warn!(session = self.session.id(), backend = %link.name(), error = %e, "backend auth failed");
                stats::auth_failed("backend_grant");
                self.pending_failed(link.id(), &e.to_string());
            }
        }
        Ok(())
    }

    /// The pending backend did not accept the player. Without a current
    /// backend to fall back on the session ends.
    fn pending_failed(&mut self, link: u64, reason: &str) {
        self.disarm_connect_deadline();
        if let Some(pending) = self.session.pending_link().filter(|l| l.id() == link) {
            stats::backend_failed(pending.name());
        }
        abandon_pending(&self.session, link, reason);
        if self.session.backend().is_none() {
            self.session.disconnect(reason);
        }
    }

    async fn promote_pending(&mut self, link: u64) -> ProxyResult<()> {
        let Some(PendingBackend { link: new_link, done }) = self.session.take_pending() else {
            return Ok(());
        };
        debug_assert_eq!(new_link.id(), link);
        self.disarm_connect_deadline();

        let previous = self.session.swap_backend(Some(new_link.clone()));
        let previous_name = previous.as_ref().map(|l| l.name().to_string());
        if let Some(old) = previous {
            old.close();
        }
        self.session.with_auth(|auth| auth.clear_sensitive_data());
        if let Err(e) = self.session.transition(SessionState::Active) {
            if let Some(done) = done {
                let _ = done.send(Err(e.to_string()));
            }
            return Err(e);
        }

        let player = self.session.identity();
        let backend = new_link.name().to_string();
        stats::backend_connected(&backend, self.dialing_since.take().map(|t| t.elapsed()));
        self.ctx.health.record(&backend, true);
        info!(
            session = self.session.id(),
            player = %player,
            backend = %backend,
            previous = previous_name.as_deref().unwrap_or("-"),
            "player connected to backend"
        );

        let dispatcher = self.ctx.dispatcher();
        if previous_name.is_none() {
            if let Some(old) = self.ctx.sessions.register_player(&self.session) {
                old.disconnect("Logged in from another location");
            }
            let post_login = PostLoginEvent {
                session_id: self.session.id(),
                player: player.clone(),
                backend: backend.clone(),
            };
            if let Err(e) = dispatcher.fire(post_login.into()).wait().await {
                debug!(session = self.session.id(), error = %e, "post-login dispatch incomplete");
            }
        }
        let connected = ServerConnectedEvent {
            session_id: self.session.id(),
            player,
            backend,
            previous: previous_name,
        };
        if let Err(e) = dispatcher.fire(connected.into()).wait().await {
            debug!(session = self.session.id(), error = %e, "server-connected dispatch incomplete");
        }

        if let Some(done) = done {
            let _ = done.send(Ok(()));
        }
        while let Some(packet) = self.held.pop_front() {
            self.session.send_to_backend(packet)?;
        }
        Ok(())
    }

    /// Transport-level close of a backend stream. `reason` is internal
    /// detail for the log; the player only sees a generic message.
    fn on_backend_closed(&mut self, link: u64, reason: Option<String>) {
        if let Some(pending) = self.session.pending_link().filter(|l| l.id() == link) {
            warn!(
                session = self.session.id(),
                backend = %pending.name(),
                reason = reason.as_deref().unwrap_or("-"),
                "backend closed before accepting the player"
            );
            self.pending_failed(link, &format!("Lost connection to {}", pending.name()));
            return;
        }
        let Some(current) = self.session.backend().filter(|l| l.id() == link) else {
            return;
        };
        if self.session.pending_link().is_some() {
            info!(session = self.session.id(), "old backend closed during transfer");
            return;
        }
        warn!(
            session = self.session.id(),
            backend = %current.name(),
            reason = reason.as_deref().unwrap_or("-"),
            "backend connection lost"
        );
        self.ctx.health.invalidate(current.name());
        self.session.close_by_backend(None);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::context::testing::context;
    use hyproxy_core::event::LoginEvent;
    use hyproxy_core::packets::{
        ChatMessage, ConnectAccept, Disconnect, DisconnectType, Ping, ServerAuthToken,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn chat(text: &str) -> Packet {
        ChatMessage {
            message: Some(text.into()),
        }
        .into()
    }

    fn disconnect_reason(packet: Packet) -> String {
        match packet {
            Packet::Disconnect(d) => d.reason.unwrap_or_default(),
            other => panic!("expected Disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_login_flow() {
        let tc = context();
        let post_logins = Arc::new(AtomicU32::new(0));
        let counter = post_logins.clone();
        tc.ctx
            .dispatcher()
            .subscribe::<PostLoginEvent, _>("test", 0, move |e| {
                assert_eq!(e.backend, "lobby");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let mut client = start(&tc, 1);
        let connect = connect_packet("Steve");
        client.send(connect.clone());

        match client.recv().await {
            Packet::AuthGrant(grant) => {
                assert_eq!(grant.authorization_grant.as_deref(), Some("client-grant"));
                assert_eq!(grant.server_identity_token.as_deref(), Some("proxy-identity"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.session.state(), SessionState::ExchangingToken);
        assert_eq!(client.session.identity().display_name(), "Steve");

        client.send(AuthToken {
            access_token: Some("client-access".into()),
            server_authorization_grant: Some("proof".into()),
        });
        client.send(chat("early"));
        match client.recv().await {
            Packet::ServerAuthToken(token) => {
                assert_eq!(token.server_access_token.as_deref(), Some("access-for-proof"))
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut backend = opened(&tc, "lobby").await;
        assert_eq!(next_backend_packet(&mut backend).await, Packet::Connect(connect.clone()));
        client.from_backend(
            &backend.link,
            AuthGrant {
                authorization_grant: Some("backend-grant".into()),
                server_identity_token: None,
            },
        );
        match next_backend_packet(&mut backend).await {
            Packet::AuthToken(token) => {
                assert_eq!(token.access_token.as_deref(), Some("access-for-backend-grant"));
                assert!(token.server_authorization_grant.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        client.from_backend(&backend.link, ServerAuthToken::default());

        assert_eq!(next_backend_packet(&mut backend).await, chat("early"));
        assert_eq!(client.session.state(), SessionState::Active);
        assert_eq!(client.session.backend_name().as_deref(), Some("lobby"));
        assert!(!client.session.with_auth(|a| a.has_sensitive_data()));
        assert!(client.session.with_auth(|a| a.handshake.is_some()));
        assert_eq!(tc.ctx.sessions.by_uuid(connect.uuid).unwrap().id(), 1);
        assert_eq!(post_logins.load(Ordering::SeqCst), 1);

        client.send(chat("hello"));
        assert_eq!(next_backend_packet(&mut backend).await, chat("hello"));
        client.from_backend(&backend.link, chat("welcome"));
        assert_eq!(client.recv().await, chat("welcome"));
    }

    #[tokio::test]
    async fn login_veto_disconnects() {
        let tc = context();
        tc.ctx
            .dispatcher()
            .subscribe::<LoginEvent, _>("bans", 0, |e| {
                if e.player.display_name() == "Griefer" {
                    e.deny("banned");
                }
                Ok(())
            });

        let mut client = start(&tc, 1);
        client.send(connect_packet("Griefer"));
        assert!(matches!(client.recv().await, Packet::AuthGrant(_)));
        client.send(AuthToken {
            access_token: Some("client-access".into()),
            server_authorization_grant: None,
        });
        assert!(matches!(client.recv().await, Packet::ServerAuthToken(_)));
        assert_eq!(disconnect_reason(client.recv().await), "Login denied");
        assert_eq!(client.session.state(), SessionState::Closed);
        assert_eq!(tc.connector.opened_count(), 0);
        client.driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_client_token_fails_session() {
        let tc = context();
        let mut client = start(&tc, 1);
        client.send(connect_packet("Steve"));
        assert!(matches!(client.recv().await, Packet::AuthGrant(_)));
        client.send(AuthToken::default());
        assert_eq!(disconnect_reason(client.recv().await), "Invalid access token");
        assert_eq!(client.session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn unauthenticated_proxy_refuses_players() {
        let tc = context();
        tc.service.unauthenticated.store(true, Ordering::SeqCst);
        let mut client = start(&tc, 1);
        client.send(connect_packet("Steve"));
        assert_eq!(
            disconnect_reason(client.recv().await),
            "Server authentication unavailable"
        );
        assert_eq!(client.session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_first_packet_must_be_connect() {
        let tc = context();
        let mut client = start(&tc, 1);
        client.send(chat("hi"));
        assert_eq!(disconnect_reason(client.recv().await), "Expected Connect, got ChatMessage");
        client.driver.await.unwrap();
    }

    #[tokio::test]
    async fn refused_backend_disconnects_client() {
        let tc = context();
        tc.connector.refuse("lobby");
        let mut client = start(&tc, 1);
        client.send(connect_packet("Steve"));
        client.recv().await;
        client.send(AuthToken {
            access_token: Some("client-access".into()),
            server_authorization_grant: None,
        });
        client.recv().await;
        assert_eq!(disconnect_reason(client.recv().await), "Could not connect to lobby");
        assert_eq!(client.session.state(), SessionState::Closed);
        assert_eq!(tc.ctx.health.cached("lobby"), Some(false));
    }

    #[tokio::test]
    async fn accepted_login_marks_backend_online() {
        let tc = context();
        assert_eq!(tc.ctx.health.cached("lobby"), None);
        let (_client, _backend) = login(&tc, 1, "Steve").await;
        assert_eq!(tc.ctx.health.cached("lobby"), Some(true));
    }

    #[tokio::test]
    async fn backend_rejecting_player_is_relayed() {
        let tc = context();
        let mut client = start(&tc, 1);
        client.send(connect_packet("Steve"));
        client.recv().await;
        client.send(AuthToken {
            access_token: Some("client-access".into()),
            server_authorization_grant: None,
        });
        client.recv().await;

        let mut backend = opened(&tc, "lobby").await;
        next_backend_packet(&mut backend).await;
        client.from_backend(
            &backend.link,
            Disconnect {
                disconnect_type: DisconnectType::Disconnect,
                reason: Some("Server is full".into()),
            },
        );
        assert_eq!(disconnect_reason(client.recv().await), "Server is full");
        assert!(backend.link.is_closed());
    }

    #[tokio::test]
    async fn test_referral_selects_backend() {
        let tc = context();
        let mut client = start(&tc, 1);
        let mut connect = connect_packet("Steve");
        connect.referral_data = Some(tc.ctx.referrals.create(connect.uuid, "survival"));
        client.send(connect);
        client.recv().await;
        client.send(AuthToken {
            access_token: Some("client-access".into()),
            server_authorization_grant: None,
        });
        client.recv().await;

        let mut backend = opened(&tc, "survival").await;
        accept(&client, &mut backend).await;
        wait_for_state(&client.session, SessionState::Active).await;
        assert_eq!(client.session.backend_name().as_deref(), Some("survival"));
        assert_eq!(tc.ctx.referrals.pending_count(), 0);
    }

    #[tokio::test]
    async fn pre_connect_handlers_redirect_and_deny() {
        let tc = context();
        let denied = Arc::new(Mutex::new(Vec::new()));
        let seen = denied.clone();
        tc.ctx
            .dispatcher()
            .subscribe::<ServerPreConnectEvent, _>("routing", 0, move |e| {
                if e.player.display_name() == "Builder" {
                    e.result = ServerResult::Allowed("creative".into());
                } else {
                    seen.lock().unwrap().push(e.original.clone());
                    e.result = ServerResult::Denied(Some("Maintenance".into()));
                }
                Ok(())
            });

        let mut builder = start(&tc, 1);
        builder.send(connect_packet("Builder"));
        builder.recv().await;
        builder.send(AuthToken {
            access_token: Some("a".into()),
            server_authorization_grant: None,
        });
        builder.recv().await;
        let backend = opened(&tc, "creative").await;
        assert_eq!(backend.link.name(), "creative");
        assert!(tc.connector.take("lobby").is_none());

        let mut other = start(&tc, 2);
        other.send(connect_packet("Steve"));
        other.recv().await;
        other.send(AuthToken {
            access_token: Some("a".into()),
            server_authorization_grant: None,
        });
        other.recv().await;
        assert_eq!(disconnect_reason(other.recv().await), "Maintenance");
        assert_eq!(*denied.lock().unwrap(), vec!["lobby".to_string()]);
    }

    #[tokio::test]
    async fn connect_accept_also_completes_login() {
        let tc = context();
        let mut client = start(&tc, 1);
        client.send(connect_packet("Steve"));
        client.recv().await;
        client.send(AuthToken {
            access_token: Some("a".into()),
            server_authorization_grant: None,
        });
        client.recv().await;
        let mut backend = opened(&tc, "lobby").await;
        next_backend_packet(&mut backend).await;
        client.from_backend(&backend.link, ConnectAccept::default());
        wait_for_state(&client.session, SessionState::Active).await;
        assert_eq!(client.session.backend().unwrap().id(), backend.link.id());
    }

    #[tokio::test]
    async fn test_stale_link_and_backend_kick() {
        let tc = context();
        let (mut client, backend) = login(&tc, 1, "Steve").await;

        client
            .session
            .inbound()
            .send(SessionInput::Backend {
                link: backend.link.id() + 100,
                packet: chat("ghost"),
            })
            .unwrap();
        client.from_backend(
            &backend.link,
            Ping {
                last_ping_raw: 37,
                ..Default::default()
            },
        );
        assert!(matches!(client.recv().await, Packet::Ping(_)));
        assert_eq!(client.session.ping_ms(), Some(37));

        client.from_backend(
            &backend.link,
            Disconnect {
                disconnect_type: DisconnectType::Disconnect,
                reason: Some("Server restarting".into()),
            },
        );
        assert_eq!(disconnect_reason(client.recv().await), "Server restarting");
        assert!(client.session.is_closed());
        assert!(backend.link.is_closed());
        client.driver.await.unwrap();
    }

    #[tokio::test]
    async fn backend_close_ends_session() {
        let tc = context();
        let (mut client, backend) = login(&tc, 1, "Steve").await;
        client
            .session
            .inbound()
            .send(SessionInput::BackendClosed {
                link: backend.link.id(),
                reason: None,
            })
            .unwrap();
        assert_eq!(disconnect_reason(client.recv().await), "Backend disconnected");
    }

    #[tokio::test]
    async fn backend_transport_error_is_not_shown_to_player() {
        let tc = context();
        let (mut client, backend) = login(&tc, 1, "Steve").await;
        client
            .session
            .inbound()
            .send(SessionInput::BackendClosed {
                link: backend.link.id(),
                reason: Some("packet 211 payload of 99999999 bytes exceeds max".into()),
            })
            .unwrap();
        assert_eq!(disconnect_reason(client.recv().await), "Backend disconnected");
        assert_eq!(client.session.state(), SessionState::Closed);
        assert_eq!(tc.ctx.health.cached("lobby"), None);
    }

    #[tokio::test]
    async fn pending_backend_transport_error_uses_generic_reason() {
        let tc = context();
        let mut client = start(&tc, 1);
        client.send(connect_packet("Steve"));
        client.recv().await;
        client.send(AuthToken {
            access_token: Some("a".into()),
            server_authorization_grant: None,
        });
        client.recv().await;
        let mut backend = opened(&tc, "lobby").await;
        next_backend_packet(&mut backend).await;
        client
            .session
            .inbound()
            .send(SessionInput::BackendClosed {
                link: backend.link.id(),
                reason: Some("frame length 4294967295 out of range".into()),
            })
            .unwrap();
        assert_eq!(disconnect_reason(client.recv().await), "Lost connection to lobby");
    }

    #[tokio::test]
    async fn silent_backend_times_out_login() {
        let tc = context();
        let mut client = start(&tc, 1);
        client.send(connect_packet("Steve"));
        client.recv().await;
        client.send(AuthToken {
            access_token: Some("a".into()),
            server_authorization_grant: None,
        });
        client.recv().await;

        let mut backend = opened(&tc, "lobby").await;
        assert!(matches!(next_backend_packet(&mut backend).await, Packet::Connect(_)));
        assert_eq!(client.session.state(), SessionState::EstablishingBackend);

        // connection_timeout is 2s in the test context; recv waits up to 5s.
        assert_eq!(
            disconnect_reason(client.recv().await),
            "Timed out connecting to lobby"
        );
        assert_eq!(client.session.state(), SessionState::Closed);
        assert!(backend.link.is_closed());
        assert!(client.session.pending_link().is_none());
        client.driver.await.unwrap();
    }

    #[tokio::test]
    async fn accepted_login_is_not_timed_out_later() {
        let mut config = crate::config::ProxyConfig {
            backends: crate::context::testing::backends(),
            ..Default::default()
        };
        config.connection_timeout = std::time::Duration::from_millis(300);
        let tc = crate::context::testing::context_with(config);
        let (mut client, _backend) = login(&tc, 1, "Steve").await;
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert_eq!(client.session.state(), SessionState::Active);
        assert!(client.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exhausted_auth_retries_fail_session() {
        let tc = context();
        tc.service.failures.store(10, Ordering::SeqCst);
        let mut client = start(&tc, 1);
        client.send(connect_packet("Steve"));

        let reason = disconnect_reason(client.recv().await);
        assert!(reason.starts_with("Authentication failed"), "{reason}");
        assert_eq!(client.session.state(), SessionState::Failed);
        assert_eq!(tc.service.calls().len(), 2);
        assert_eq!(tc.connector.opened_count(), 0);
        client.driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_login_kicks_older_session() {
        let tc = context();
        let (mut first, _b1) = login(&tc, 1, "Steve").await;
        let uuid = first.session.identity().uuid.unwrap();

        let mut second = start(&tc, 2);
        let mut connect = connect_packet("Steve");
        connect.uuid = uuid;
        second.send(connect);
        second.recv().await;
        second.send(AuthToken {
            access_token: Some("a".into()),
            server_authorization_grant: None,
        });
        second.recv().await;
        let mut backend = opened(&tc, "lobby").await;
        accept(&second, &mut backend).await;
        wait_for_state(&second.session, SessionState::Active).await;

        assert_eq!(
            disconnect_reason(first.recv().await),
            "Logged in from another location"
        );
        assert_eq!(tc.ctx.sessions.by_uuid(uuid).unwrap().id(), 2);
    }

    #[tokio::test]
    async fn client_close_tears_down() {
        let tc = context();
        let (client, backend) = login(&tc, 1, "Steve").await;
        client.session.inbound().send(SessionInput::ClientClosed).unwrap();
        client.driver.await.unwrap();
        assert!(backend.link.is_closed());
        assert_eq!(client.session.state(), SessionState::Closed);
    }
}

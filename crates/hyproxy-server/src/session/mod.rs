//! Proxy sessions: one per connected client.
//!
//! A session owns the client's outbound channel and, once established, a
//! link to exactly one backend. Reader tasks for both sides push into the
//! session's inbound queue, which a single driver task consumes in order.

pub mod auth_state;
pub mod driver;
pub mod manager;
pub mod state;

pub use auth_state::SessionAuthState;
pub use driver::SessionDriver;
pub use manager::SessionManager;
pub use state::{AtomicSessionState, SessionState};

use crate::error::{ProxyError, ProxyResult};
use crate::stats;
use hyproxy_core::event::{DisconnectEvent, DisconnectReason};
use hyproxy_core::packets::{Disconnect, DisconnectType};
use hyproxy_core::{
    Direction, Intercept, InterceptionPipeline, Packet, PacketContext, PlayerIdentity, SessionRef,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Input to a session's driver task.
#[derive(Debug)]
pub enum SessionInput {
    Client(Packet),
    Backend { link: u64, packet: Packet },
    BackendClosed { link: u64, reason: Option<String> },
    /// The connect deadline for pending link `link` passed.
    BackendTimeout { link: u64 },
    ClientClosed,
}

/// Outbound half of an upstream connection.
#[derive(Debug)]
pub struct BackendLink {
    id: u64,
    name: String,
    tx: mpsc::UnboundedSender<Packet>,
    shutdown: CancellationToken,
}

impl BackendLink {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        tx: mpsc::UnboundedSender<Packet>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            tx,
            shutdown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, packet: Packet) -> ProxyResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ProxyError::Transport(format!("backend {} link closed", self.name)));
        }
        self.tx
            .send(packet)
            .map_err(|_| ProxyError::Transport(format!("backend {} link closed", self.name)))
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

/// A backend connection that has not finished authenticating yet.
///
/// It becomes the session's current link once the backend accepts the
/// player. `done` is resolved for transfers waiting on the outcome.
#[derive(Debug)]
pub struct PendingBackend {
    pub link: Arc<BackendLink>,
    pub done: Option<oneshot::Sender<Result<(), String>>>,
}

impl PendingBackend {
    pub fn new(link: Arc<BackendLink>) -> Self {
        Self { link, done: None }
    }

    pub fn with_notify(link: Arc<BackendLink>, done: oneshot::Sender<Result<(), String>>) -> Self {
        Self {
            link,
            done: Some(done),
        }
    }

    /// Close the link and tell the waiter why.
    pub fn abandon(mut self, reason: &str) {
        self.link.close();
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(reason.to_string()));
        }
    }
}

pub struct ProxySession {
    id: u64,
    remote_addr: SocketAddr,
    state: AtomicSessionState,
    identity: RwLock<PlayerIdentity>,
    auth: Mutex<SessionAuthState>,
    client_tx: mpsc::UnboundedSender<Packet>,
    backend: RwLock<Option<Arc<BackendLink>>>,
    pending: Mutex<Option<PendingBackend>>,
    inbound: mpsc::UnboundedSender<SessionInput>,
    pipeline: InterceptionPipeline,
    closing: AtomicBool,
    shutdown: CancellationToken,
    ping_ms: AtomicI32,
    next_link_id: AtomicU64,
}

impl ProxySession {
    /// Create a session for a freshly accepted connection, capturing its
    /// client certificate fingerprint. The returned receiver feeds the
    /// session's driver.
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
        client_fingerprint: Option<String>,
        client_tx: mpsc::UnboundedSender<Packet>,
        pipeline: InterceptionPipeline,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionInput>) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let has_certificate = client_fingerprint.is_some();
        let session = Arc::new(Self {
            id,
            remote_addr,
            state: AtomicSessionState::new(SessionState::AwaitingHandshake),
            identity: RwLock::new(PlayerIdentity::unknown()),
            auth: Mutex::new(SessionAuthState::new(client_fingerprint)),
            client_tx,
            backend: RwLock::new(None),
            pending: Mutex::new(None),
            inbound,
            pipeline,
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            ping_ms: AtomicI32::new(-1),
            next_link_id: AtomicU64::new(1),
        });
        let _ = session.state.transition(SessionState::CapturingIdentity);
        debug!(session = id, remote = %remote_addr, has_certificate, "client identity captured");
        (session, inbound_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn transition(&self, next: SessionState) -> ProxyResult<SessionState> {
        match self.state.transition(next) {
            Ok(from) => {
                debug!(session = self.id, from = %from, to = %next, "session state changed");
                Ok(from)
            }
            Err(current) => Err(ProxyError::Other(format!(
                "illegal session transition {current} -> {next}"
            ))),
        }
    }

    pub fn identity(&self) -> PlayerIdentity {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_identity(&self, identity: PlayerIdentity) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = identity;
    }

    /// Run `f` with the auth state locked.
    pub fn with_auth<R>(&self, f: impl FnOnce(&mut SessionAuthState) -> R) -> R {
        let mut auth = self.auth.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut auth)
    }

    pub fn backend(&self) -> Option<Arc<BackendLink>> {
        self.backend
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn backend_name(&self) -> Option<String> {
        self.backend().map(|link| link.name().to_string())
    }

    /// Install `link` as the current backend, returning the one it replaced.
    pub fn swap_backend(&self, link: Option<Arc<BackendLink>>) -> Option<Arc<BackendLink>> {
        let mut slot = self.backend.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, link)
    }

    /// Park a connecting backend. Any backend already pending is abandoned.
    pub fn set_pending(&self, pending: PendingBackend) {
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(pending);
        if let Some(previous) = previous {
            previous.abandon("superseded by another connection attempt");
        }
    }

    pub fn take_pending(&self) -> Option<PendingBackend> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn pending_link(&self) -> Option<Arc<BackendLink>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.link.clone())
    }

    pub fn next_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sender that reader tasks use to feed this session's driver.
    pub fn inbound(&self) -> mpsc::UnboundedSender<SessionInput> {
        self.inbound.clone()
    }

    pub fn pipeline(&self) -> &InterceptionPipeline {
        &self.pipeline
    }

    pub fn snapshot(&self) -> SessionRef {
        SessionRef {
            session_id: self.id,
            player: self.identity(),
            backend: self.backend_name(),
        }
    }

    pub fn ping_ms(&self) -> Option<i32> {
        let ping = self.ping_ms.load(Ordering::Relaxed);
        (ping >= 0).then_some(ping)
    }

    pub fn set_ping_ms(&self, ping: i32) {
        self.ping_ms.store(ping, Ordering::Relaxed);
    }

    /// Run `packet` through the pipeline toward the client.
    /// Returns whether anything was written.
    pub fn send_to_client(&self, packet: Packet) -> ProxyResult<bool> {
        match self.intercept(Direction::ServerToClient, packet)? {
            Some(packet) => self.send_raw_to_client(packet).map(|_| true),
            None => Ok(false),
        }
    }

    /// Run `packet` through the pipeline toward the backend.
    pub fn send_to_backend(&self, packet: Packet) -> ProxyResult<bool> {
        match self.intercept(Direction::ClientToServer, packet)? {
            Some(packet) => self.send_raw_to_backend(packet).map(|_| true),
            None => Ok(false),
        }
    }

    fn intercept(&self, direction: Direction, packet: Packet) -> ProxyResult<Option<Packet>> {
        if self.is_closed() {
            return Err(ProxyError::SessionClosed);
        }
        stats::packet(direction);
        let ctx = PacketContext::new(direction, self.snapshot());
        Ok(match self.pipeline.process(&ctx, packet) {
            Intercept::Forward(packet) => Some(packet),
            Intercept::Drop => None,
        })
    }

    /// Write to the client without interception.
    pub fn send_raw_to_client(&self, packet: Packet) -> ProxyResult<()> {
        self.client_tx
            .send(packet)
            .map_err(|_| ProxyError::SessionClosed)
    }

    /// Write to the current backend without interception.
    pub fn send_raw_to_backend(&self, packet: Packet) -> ProxyResult<()> {
        match self.backend() {
            Some(link) => link.send(packet),
            None => Err(ProxyError::Transport("no backend connected".into())),
        }
    }

    /// Kick the client with `reason`. Idempotent.
    pub fn disconnect(&self, reason: &str) {
        self.terminate(SessionState::Closed, DisconnectReason::Kicked, Some(reason));
    }

    /// Kick the client after an unrecoverable error. Idempotent.
    pub fn fail(&self, reason: &str) {
        self.terminate(SessionState::Failed, DisconnectReason::Error, Some(reason));
    }

    /// Tear down both sides without telling the client why. Idempotent.
    pub fn close(&self) {
        self.terminate(SessionState::Closed, DisconnectReason::Disconnected, None);
    }

    /// The backend dropped the player. `message` is the backend's own
    /// Disconnect text; transport failures pass `None`.
    pub fn close_by_backend(&self, message: Option<String>) {
        let reason = message.as_deref().unwrap_or("Backend disconnected").to_string();
        self.terminate(
            SessionState::Closed,
            DisconnectReason::ServerDisconnect,
            Some(&reason),
        );
    }

    fn terminate(&self, state: SessionState, reason: DisconnectReason, message: Option<&str>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(text) = message {
            let packet = Disconnect {
                disconnect_type: DisconnectType::Disconnect,
                reason: Some(text.to_string()),
            };
            let _ = self.send_raw_to_client(packet.into());
        }
        let _ = self.state.transition(state);
        stats::session_closed(if state == SessionState::Failed { "failed" } else { "closed" });
        if let Some(link) = self.swap_backend(None) {
            link.close();
        }
        if let Some(pending) = self.take_pending() {
            pending.abandon("session closed");
        }
        self.shutdown.cancel();

        let player = self.identity();
        info!(
            session = self.id,
            player = %player,
            reason = ?reason,
            message = message.unwrap_or(""),
            "session closed"
        );

        let event = DisconnectEvent {
            session_id: self.id,
            player,
            reason,
            message: message.map(str::to_string),
        };
        let dispatcher = self.pipeline.dispatcher();
        if tokio::runtime::Handle::try_current().is_ok() {
            drop(dispatcher.fire(event.into()));
        } else {
            dispatcher.fire_sync(event.into());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Cancelled once the session has been torn down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("backend", &self.backend_name())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use hyproxy_core::{EventDispatcher, MappingRegistry};

    pub(crate) struct TestSession {
        pub session: Arc<ProxySession>,
        pub client_rx: mpsc::UnboundedReceiver<Packet>,
        pub inbound_rx: mpsc::UnboundedReceiver<SessionInput>,
    }

    pub(crate) fn pipeline() -> InterceptionPipeline {
        InterceptionPipeline::new(
            Arc::new(MappingRegistry::with_defaults()),
            EventDispatcher::new(),
        )
    }

    pub(crate) fn session_with(id: u64, pipeline: InterceptionPipeline) -> TestSession {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (session, inbound_rx) = ProxySession::new(
            id,
            "127.0.0.1:40000".parse().unwrap(),
            Some("client-fp".into()),
            client_tx,
            pipeline,
        );
        TestSession {
            session,
            client_rx,
            inbound_rx,
        }
    }

    pub(crate) fn session(id: u64) -> TestSession {
        session_with(id, pipeline())
    }

    /// A backend link whose outbound packets land in the returned receiver.
    pub(crate) fn link(
        session: &ProxySession,
        name: &str,
    ) -> (Arc<BackendLink>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(BackendLink::new(
            session.next_link_id(),
            name,
            tx,
            CancellationToken::new(),
        ));
        (link, rx)
    }

    /// Drive a session straight to `Active` on `backend`.
    pub(crate) fn activate(
        session: &ProxySession,
        backend: &str,
    ) -> (Arc<BackendLink>, mpsc::UnboundedReceiver<Packet>) {
        for state in [
            SessionState::ExchangingToken,
            SessionState::EstablishingBackend,
            SessionState::Active,
        ] {
            session.transition(state).unwrap();
        }
        let (link, rx) = link(session, backend);
        session.swap_backend(Some(link.clone()));
        (link, rx)
    }
}

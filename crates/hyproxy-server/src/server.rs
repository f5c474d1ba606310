//! Client-facing listener: accepts QUIC connections and runs one session
//! per connection.

use crate::context::ProxyContext;
use crate::error::ProxyResult;
use crate::session::{ProxySession, SessionDriver, SessionInput, SessionState};
use crate::stats;
use crate::transport::quic::{spawn_reader, spawn_writer, start_listener};
use crate::transfer::TransferCoordinator;
use crate::transport::{IncomingClient, StreamEvent};
use hyproxy_core::messaging::Subscription;
use hyproxy_core::packets::{ServerMessage, ServerMessageType};
use hyproxy_core::{ChannelMessage, MessagingService};
use serde::Deserialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel whose messages are shown to every connected player.
pub const BROADCAST_CHANNEL: &str = "hyproxy:broadcast";
/// Channel carrying `{"player", "server", "mode"}` transfer requests.
pub const TRANSFER_REQUEST_CHANNEL: &str = "hyproxy:transfer-requests";

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a closing connection gets to deliver its last packets.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    tls: Arc<rustls::ServerConfig>,
}

impl ProxyServer {
    pub fn new(ctx: Arc<ProxyContext>, tls: Arc<rustls::ServerConfig>) -> Self {
        Self { ctx, tls }
    }

    /// Bind the configured address and serve until the endpoint closes.
    pub async fn run(self) -> ProxyResult<()> {
        let bind = self.ctx.config.bind_socket_addr()?;
        let (endpoint, incoming) = start_listener(bind, self.tls.clone(), IDLE_TIMEOUT).await?;
        info!(
            addr = %bind,
            backends = self.ctx.config.backends.len(),
            max_connections = self.ctx.config.max_connections,
            "hyproxy listening"
        );
        self.serve(incoming).await;
        endpoint.close(0u32.into(), b"proxy shutting down");
        Ok(())
    }

    /// Run a session for every connection `incoming` yields.
    pub async fn serve(self, mut incoming: mpsc::Receiver<IncomingClient>) {
        let broadcasts = listen_for_broadcasts(&self.ctx);
        let transfers = listen_for_transfer_requests(&self.ctx);
        while let Some(client) = incoming.recv().await {
            let ctx = self.ctx.clone();
            tokio::spawn(handle_connection(ctx, client));
        }
        broadcasts.unsubscribe();
        transfers.unsubscribe();
        info!("listener stopped");
    }
}

/// Show every message published on [`BROADCAST_CHANNEL`] to active players.
fn listen_for_broadcasts(ctx: &Arc<ProxyContext>) -> Subscription {
    let sessions = ctx.sessions.clone();
    ctx.messaging.subscribe_including_self(
        BROADCAST_CHANNEL,
        Arc::new(move |_, message: &ChannelMessage| {
            let Some(text) = broadcast_text(message) else {
                debug!(source = %message.source, "ignoring broadcast without text");
                return;
            };
            let mut delivered = 0usize;
            for session in sessions.all() {
                if session.state() != SessionState::Active {
                    continue;
                }
                let notice = ServerMessage {
                    message_type: ServerMessageType::Notification,
                    message: Some(text.clone()),
                };
                if session.send_raw_to_client(notice.into()).is_ok() {
                    delivered += 1;
                }
            }
            info!(source = %message.source, delivered, "broadcast delivered");
        }),
    )
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TransferMode {
    #[default]
    Referral,
    Rebind,
}

#[derive(Debug, Deserialize)]
struct TransferRequest {
    /// Username or uuid.
    player: String,
    server: String,
    #[serde(default)]
    mode: TransferMode,
}

/// Move players on request. Results are published by the coordinator on
/// success and logged on failure.
fn listen_for_transfer_requests(ctx: &Arc<ProxyContext>) -> Subscription {
    let weak: Weak<ProxyContext> = Arc::downgrade(ctx);
    let runtime = tokio::runtime::Handle::current();
    ctx.messaging.subscribe_including_self(
        TRANSFER_REQUEST_CHANNEL,
        Arc::new(move |_, message: &ChannelMessage| {
            let Some(ctx) = weak.upgrade() else {
                return;
            };
            let request: TransferRequest = match serde_json::from_value(message.payload.clone()) {
                Ok(request) => request,
                Err(e) => {
                    warn!(source = %message.source, error = %e, "malformed transfer request");
                    return;
                }
            };
            let session = request
                .player
                .parse::<Uuid>()
                .ok()
                .and_then(|uuid| ctx.sessions.by_uuid(uuid))
                .or_else(|| ctx.sessions.by_name(&request.player));
            let Some(session) = session else {
                warn!(player = %request.player, "transfer requested for unknown player");
                return;
            };
            runtime.spawn(async move {
                let coordinator = TransferCoordinator::new(ctx);
                let result = match request.mode {
                    TransferMode::Referral => coordinator.transfer_by_name(&session, &request.server).await,
                    TransferMode::Rebind => coordinator.rebind_by_name(&session, &request.server).await,
                };
                if let Err(e) = result {
                    warn!(
                        session = session.id(),
                        server = %request.server,
                        mode = ?request.mode,
                        error = %e,
                        "transfer request failed"
                    );
                }
            });
        }),
    )
}

fn broadcast_text(message: &ChannelMessage) -> Option<String> {
    match &message.payload {
        serde_json::Value::String(text) => Some(text.clone()),
        payload => payload
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
    }
    .filter(|text| !text.is_empty())
}

async fn handle_connection(ctx: Arc<ProxyContext>, client: IncomingClient) {
    let IncomingClient {
        connection,
        remote_addr,
        fingerprint,
    } = client;

    if !ctx.sessions.has_capacity() {
        warn!(remote = %remote_addr, "connection limit reached, refusing client");
        stats::connection_rejected("full");
        connection.close(1u32.into(), b"server full");
        return;
    }

    let (send, recv) = match tokio::time::timeout(ctx.config.connection_timeout, connection.accept_bi()).await {
        Ok(Ok(streams)) => streams,
        Ok(Err(e)) => {
            debug!(remote = %remote_addr, error = %e, "client left before opening a stream");
            return;
        }
        Err(_) => {
            debug!(remote = %remote_addr, "client opened no stream in time");
            stats::connection_rejected("handshake_timeout");
            connection.close(2u32.into(), b"handshake timeout");
            return;
        }
    };

    let id = ctx.sessions.next_session_id();
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (session, inbound_rx) =
        ProxySession::new(id, remote_addr, fingerprint, client_tx, ctx.pipeline.clone());
    if let Err(e) = ctx.sessions.register(session.clone()) {
        warn!(session = id, remote = %remote_addr, error = %e, "session rejected");
        stats::connection_rejected("full");
        connection.close(1u32.into(), b"server full");
        return;
    }
    info!(session = id, remote = %remote_addr, "client connected");
    stats::connection_accepted();

    let shutdown = session.shutdown_token();
    let label = format!("session-{id}/client");
    let writer = spawn_writer(send, client_rx, ctx.registry.clone(), shutdown.clone(), label.clone());
    let inbound = session.inbound();
    spawn_reader(recv, ctx.registry.clone(), shutdown.clone(), label, move |event| match event {
        StreamEvent::Packet(packet) => inbound.send(SessionInput::Client(packet)).is_ok(),
        StreamEvent::Closed(_) => {
            let _ = inbound.send(SessionInput::ClientClosed);
            false
        }
    });

    let watched = connection.clone();
    let inbound = session.inbound();
    let watch_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watch_shutdown.cancelled() => {}
            reason = watched.closed() => {
                debug!(session = id, reason = %reason, "client connection lost");
                let _ = inbound.send(SessionInput::ClientClosed);
            }
        }
    });

    SessionDriver::new(ctx.clone(), session.clone(), inbound_rx).run().await;

    ctx.sessions.remove(id);
    let _ = writer.await;
    let _ = tokio::time::timeout(CLOSE_GRACE, connection.closed()).await;
    connection.close(0u32.into(), b"session closed");
    debug!(session = id, "connection finished");
}

//! Moving players between backends.
//!
//! Two strategies are supported. A referral transfer tells the client to
//! reconnect to the proxy's public address with a payload naming the
//! target; the reconnect is routed by [`ReferralManager::consume`]. A
//! rebind switches the upstream link in place, replaying the retained
//! handshake, while the client connection stays untouched.

pub mod referral;

pub use referral::ReferralManager;

use crate::config::{BackendConfig, ProxyConfig};
use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::session::driver::{abandon_pending, open_backend};
use crate::session::{ProxySession, SessionState};
use crate::stats;
use hyproxy_core::event::{EventKind, PlayerTransferEvent, ServerResult};
use hyproxy_core::packets::{ClientReferral, HostAddress};
use hyproxy_core::{ChannelMessage, MessagingService};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

/// Channel transfer notices are published on.
pub const TRANSFER_CHANNEL: &str = "hyproxy:transfers";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("player is not connected to a server (state {0})")]
    NotActive(SessionState),

    #[error("player has no known identity")]
    UnknownPlayer,

    #[error("unknown server {0}")]
    UnknownServer(String),

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("{0}")]
    Denied(String),

    #[error("server {0} is not reachable")]
    Unreachable(String),

    #[error("public port {0} cannot be advertised")]
    InvalidPort(u16),

    #[error("could not reach the player: {0}")]
    Send(String),

    #[error("could not connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    #[error("timed out switching to {0}")]
    Timeout(String),
}

/// Name of the backend the player was sent to, or why not.
pub type TransferResult = Result<String, TransferError>;

/// Host and port clients are told to reconnect to.
///
/// Uses the configured public address, else the bind address unless it is
/// the wildcard, else loopback. The port is the public port, else the bind
/// port, and must fit the protocol's signed 16-bit field.
pub fn referral_address(config: &ProxyConfig) -> Result<HostAddress, TransferError> {
    let host = match config.public_address.as_deref().filter(|a| !a.is_empty()) {
        Some(public) => public.to_string(),
        None if config.bind_address != "0.0.0.0" && !config.bind_address.is_empty() => {
            config.bind_address.clone()
        }
        None => "127.0.0.1".to_string(),
    };
    let port = if config.public_port > 0 {
        config.public_port
    } else {
        config.bind_port
    };
    let port = i16::try_from(port).map_err(|_| TransferError::InvalidPort(port))?;
    Ok(HostAddress { port, host })
}

pub struct TransferCoordinator {
    ctx: Arc<ProxyContext>,
}

impl TransferCoordinator {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Check the session can move and let handlers veto or redirect.
    async fn prepare(
        &self,
        session: &ProxySession,
        target: &BackendConfig,
    ) -> Result<(Uuid, BackendConfig), TransferError> {
        let state = session.state();
        if state != SessionState::Active {
            return Err(TransferError::NotActive(state));
        }
        let player = session.identity();
        let uuid = player.uuid.ok_or(TransferError::UnknownPlayer)?;
        let current = session.backend_name();
        if current
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(&target.name))
        {
            return Err(TransferError::AlreadyConnected(target.name.clone()));
        }

        let event = PlayerTransferEvent::new(session.id(), player, current.clone(), &target.name);
        let result = match self.ctx.dispatcher().fire(event.into()).wait().await {
            Ok(fired) => PlayerTransferEvent::from_event(fired).map(|e| e.result),
            Err(e) => {
                warn!(session = session.id(), error = %e, "transfer event dispatch failed");
                None
            }
        }
        .unwrap_or_else(|| ServerResult::Allowed(target.name.clone()));

        let backend = match result {
            ServerResult::Denied(reason) => {
                return Err(TransferError::Denied(
                    reason.unwrap_or_else(|| "Transfer denied".to_string()),
                ))
            }
            ServerResult::Allowed(name) => self
                .ctx
                .config
                .backend_by_name(&name)
                .cloned()
                .ok_or(TransferError::UnknownServer(name))?,
        };
        if current
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(&backend.name))
        {
            return Err(TransferError::AlreadyConnected(backend.name));
        }
        Ok((uuid, backend))
    }

    fn announce(&self, session: &ProxySession, from: Option<String>, to: &str, mode: &str) {
        let player = session.identity();
        let message = ChannelMessage::new(
            self.ctx.messaging.local_id(),
            "transfer",
            serde_json::json!({
                "uuid": player.uuid,
                "username": player.username,
                "from": from,
                "to": to,
                "mode": mode,
            }),
        );
        self.ctx.messaging.publish(TRANSFER_CHANNEL, &message);
    }

    /// Send the player to `target` by referral.
    pub async fn transfer(&self, session: &Arc<ProxySession>, target: &BackendConfig) -> TransferResult {
        stats::transfer_started();
        let result = self.refer(session, target).await;
        stats::transfer_finished(&result);
        result
    }

    async fn refer(&self, session: &Arc<ProxySession>, target: &BackendConfig) -> TransferResult {
        let (uuid, backend) = self.prepare(session, target).await?;

        if !self.ctx.health.is_online(&backend).await {
            warn!(session = session.id(), backend = %backend.name, "transfer target unreachable");
            return Err(TransferError::Unreachable(backend.name));
        }

        let host_to = referral_address(&self.ctx.config)?;
        let data = self.ctx.referrals.create(uuid, &backend.name);
        let referral = ClientReferral {
            host_to: Some(host_to.clone()),
            data: Some(data),
        };
        if let Err(e) = session.send_raw_to_client(referral.into()) {
            self.ctx.referrals.cancel(uuid);
            return Err(TransferError::Send(e.to_string()));
        }

        let from = session.backend_name();
        info!(
            session = session.id(),
            player = %session.identity(),
            from = from.as_deref().unwrap_or("-"),
            to = %backend.name,
            via = %format!("{}:{}", host_to.host, host_to.port),
            "player referred"
        );
        self.announce(session, from, &backend.name, "referral");
        Ok(backend.name)
    }

    /// Send the player to the backend called `name`.
    pub async fn transfer_by_name(&self, session: &Arc<ProxySession>, name: &str) -> TransferResult {
        let target = self
            .ctx
            .config
            .backend_by_name(name)
            .cloned()
            .ok_or_else(|| TransferError::UnknownServer(name.to_string()))?;
        self.transfer(session, &target).await
    }

    /// Switch the session's backend in place.
    ///
    /// Needs the session's driver running, since the new backend's answers
    /// arrive through it. On failure the old backend is kept if its link is
    /// still open, otherwise the session ends.
    pub async fn rebind(&self, session: &Arc<ProxySession>, target: &BackendConfig) -> TransferResult {
        stats::transfer_started();
        let result = self.switch(session, target).await;
        stats::transfer_finished(&result);
        result
    }

    async fn switch(&self, session: &Arc<ProxySession>, target: &BackendConfig) -> TransferResult {
        let (_, backend) = self.prepare(session, target).await?;
        session
            .transition(SessionState::Transferring)
            .map_err(|_| TransferError::NotActive(session.state()))?;
        let from = session.backend_name();

        let (done_tx, done_rx) = oneshot::channel();
        let link = match open_backend(&self.ctx, session, &backend, Some(done_tx)).await {
            Ok(link) => link,
            Err(e) => {
                self.revert(session, &backend.name);
                return Err(match e {
                    ProxyError::Timeout => TransferError::Timeout(backend.name),
                    e => TransferError::Connect {
                        server: backend.name,
                        reason: e.to_string(),
                    },
                });
            }
        };

        match tokio::time::timeout(self.ctx.config.connection_timeout, done_rx).await {
            Ok(Ok(Ok(()))) => {
                self.announce(session, from, &backend.name, "rebind");
                Ok(backend.name)
            }
            Ok(Ok(Err(reason))) => {
                self.revert(session, &backend.name);
                Err(TransferError::Connect {
                    server: backend.name,
                    reason,
                })
            }
            Ok(Err(_)) => {
                self.revert(session, &backend.name);
                Err(TransferError::Connect {
                    server: backend.name,
                    reason: "connection attempt dropped".to_string(),
                })
            }
            Err(_) => {
                abandon_pending(session, link.id(), "timed out");
                self.revert(session, &backend.name);
                Err(TransferError::Timeout(backend.name))
            }
        }
    }

    pub async fn rebind_by_name(&self, session: &Arc<ProxySession>, name: &str) -> TransferResult {
        let target = self
            .ctx
            .config
            .backend_by_name(name)
            .cloned()
            .ok_or_else(|| TransferError::UnknownServer(name.to_string()))?;
        self.rebind(session, &target).await
    }

    fn revert(&self, session: &ProxySession, target: &str) {
        if session.is_closed() {
            return;
        }
        let alive = session.backend().is_some_and(|link| !link.is_closed());
        if alive && session.transition(SessionState::Active).is_ok() {
            warn!(session = session.id(), target, "rebind failed, staying on current backend");
            return;
        }
        warn!(session = session.id(), target, "rebind failed and the old backend is gone");
        session.disconnect(&format!("Could not connect to {target}"));
    }
}

//! Commands the proxy answers itself instead of forwarding them.
//!
//! `/server` lists backends or moves a player, `/find` says where a player
//! is, `/sessions` lists every connection. Anything else reaches the
//! backend untouched.

use crate::context::ProxyContext;
use crate::session::ProxySession;
use crate::transfer::{TransferCoordinator, TransferError};
use hyproxy_core::event::{priority, ListenerId, PlayerCommandEvent};
use hyproxy_core::packets::{ServerMessage, ServerMessageType};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const COMMAND_OWNER: &str = "hyproxy:commands";

/// Answer built-in commands for as long as `ctx` lives.
pub fn register(ctx: &Arc<ProxyContext>) -> ListenerId {
    let weak: Weak<ProxyContext> = Arc::downgrade(ctx);
    let runtime = Handle::current();
    ctx.dispatcher()
        .subscribe::<PlayerCommandEvent, _>(COMMAND_OWNER, priority::EARLY, move |event| {
            let Some(ctx) = weak.upgrade() else {
                return Ok(());
            };
            let Some(session) = ctx.sessions.get(event.session_id) else {
                return Ok(());
            };
            let args: Vec<&str> = event
                .args
                .iter()
                .map(String::as_str)
                .filter(|a| !a.is_empty())
                .collect();
            match event.command.as_str() {
                "server" => server(&ctx, &runtime, &session, &args),
                "find" => find(&ctx, &session, &args),
                "sessions" => sessions(&ctx, &session),
                _ => return Ok(()),
            }
            debug!(session = session.id(), command = %event.command, "command handled by proxy");
            event.forward_to_server = false;
            Ok(())
        })
}

fn reply(session: &ProxySession, text: impl Into<String>) {
    let message = ServerMessage {
        message_type: ServerMessageType::Chat,
        message: Some(text.into()),
    };
    let _ = session.send_raw_to_client(message.into());
}

fn player_count(players: usize) -> String {
    if players == 1 {
        "1 player".to_string()
    } else {
        format!("{players} players")
    }
}

/// One line per backend with its player count, marking the caller's.
fn server_list(ctx: &ProxyContext, current: Option<&str>) -> Vec<String> {
    let sessions = ctx.sessions.all();
    let mut lines = vec!["Available servers:".to_string()];
    for backend in &ctx.config.backends {
        let players = sessions
            .iter()
            .filter(|s| {
                s.backend_name()
                    .is_some_and(|b| b.eq_ignore_ascii_case(&backend.name))
            })
            .count();
        let mut line = format!("  - {} ({})", backend.name, player_count(players));
        if current.is_some_and(|c| c.eq_ignore_ascii_case(&backend.name)) {
            line.push_str(" [current]");
        }
        if ctx.health.cached(&backend.name) == Some(false) {
            line.push_str(" [offline]");
        }
        lines.push(line);
    }
    lines.push("Use /server <name> [player] to switch.".to_string());
    lines
}

fn lookup(ctx: &ProxyContext, player: &str) -> Option<Arc<ProxySession>> {
    player
        .parse::<Uuid>()
        .ok()
        .and_then(|uuid| ctx.sessions.by_uuid(uuid))
        .or_else(|| ctx.sessions.by_name(player))
}

fn server(ctx: &Arc<ProxyContext>, runtime: &Handle, source: &Arc<ProxySession>, args: &[&str]) {
    let Some(&name) = args.first() else {
        for line in server_list(ctx, source.backend_name().as_deref()) {
            reply(source, line);
        }
        return;
    };
    let Some(backend) = ctx.config.backend_by_name(name).cloned() else {
        reply(source, format!("Unknown server: {name}"));
        return;
    };
    let target = match args.get(1) {
        Some(player) => match lookup(ctx, player) {
            Some(target) => target,
            None => {
                reply(source, format!("Player is not online: {player}"));
                return;
            }
        },
        None => source.clone(),
    };
    if target
        .backend_name()
        .is_some_and(|b| b.eq_ignore_ascii_case(&backend.name))
    {
        reply(source, format!("{} is already connected to {}", target.identity().display_name(), backend.name));
        return;
    }

    reply(source, format!("Connecting {} to {}...", target.identity().display_name(), backend.name));
    info!(
        session = source.id(),
        player = %target.identity(),
        to = %backend.name,
        "server command transfer"
    );
    let coordinator = TransferCoordinator::new(ctx.clone());
    let source = source.clone();
    runtime.spawn(async move {
        if let Err(e) = coordinator.transfer(&target, &backend).await {
            warn!(session = target.id(), backend = %backend.name, error = %e, "server command transfer failed");
            let reason = match e {
                TransferError::Unreachable(name) => format!("{name} is offline"),
                e => e.to_string(),
            };
            reply(&source, format!("Transfer failed: {reason}"));
        }
    });
}

fn find(ctx: &ProxyContext, source: &ProxySession, args: &[&str]) {
    let Some(player) = args.first() else {
        reply(source, "Usage: /find <player>");
        return;
    };
    match lookup(ctx, player) {
        Some(found) => {
            let server = found.backend_name().unwrap_or_else(|| "no server".to_string());
            reply(source, format!("{} is currently on {server}", found.identity().display_name()));
        }
        None => reply(source, "That player could not be found."),
    }
}

fn sessions(ctx: &ProxyContext, source: &ProxySession) {
    let mut all = ctx.sessions.all();
    all.sort_by_key(|s| s.id());
    reply(source, format!("Active sessions: {}", all.len()));
    for session in all {
        reply(
            source,
            format!(
                "  - Session {}: {} -> {}",
                session.id(),
                session.identity(),
                session.backend_name().as_deref().unwrap_or("connecting")
            ),
        );
    }
}

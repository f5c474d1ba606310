//! Built-in mappings.

use super::{PacketContext, PacketEventMapping};
use crate::event::{
    DisconnectEvent, DisconnectReason, EventKind, EventType, LoginEvent, PlayerChatEvent,
    PlayerCommandEvent, ProxyEvent, ServerMessageEvent,
};
use crate::packets::{Packet, PacketKind};
use std::sync::Arc;

const COMMAND_PREFIX: char = '/';
const TIMEOUT_KEYWORD: &str = "timeout";

pub fn all() -> Vec<Arc<dyn PacketEventMapping>> {
    vec![
        Arc::new(ConnectMapping),
        Arc::new(DisconnectMapping),
        Arc::new(ChatMessageMapping),
        Arc::new(ServerMessageMapping),
    ]
}

/// Client handshake → [`LoginEvent`]. A denied login drops the handshake.
pub struct ConnectMapping;

impl PacketEventMapping for ConnectMapping {
    fn kind(&self) -> PacketKind {
        PacketKind::Connect
    }

    fn event_type(&self) -> EventType {
        EventType::Login
    }

    fn create_event(&self, ctx: &PacketContext, packet: &Packet) -> Option<ProxyEvent> {
        if !ctx.direction.is_client_to_server() || !matches!(packet, Packet::Connect(_)) {
            return None;
        }
        Some(LoginEvent::new(ctx.session_id(), ctx.player().clone()).into())
    }

    fn apply_changes(&self, _: &PacketContext, packet: Packet, _: &ProxyEvent) -> Option<Packet> {
        Some(packet)
    }

    fn is_cancelled(&self, event: &ProxyEvent) -> bool {
        !event.is_allowed()
    }
}

/// Backend kick → [`DisconnectEvent`]. Observed only; never cancelled.
pub struct DisconnectMapping;

impl PacketEventMapping for DisconnectMapping {
    fn kind(&self) -> PacketKind {
        PacketKind::Disconnect
    }

    fn event_type(&self) -> EventType {
        EventType::Disconnect
    }

    fn create_event(&self, ctx: &PacketContext, packet: &Packet) -> Option<ProxyEvent> {
        let Packet::Disconnect(disconnect) = packet else {
            return None;
        };
        if !ctx.direction.is_server_to_client() {
            return None;
        }
        let reason = match &disconnect.reason {
            Some(text) if text.to_lowercase().contains(TIMEOUT_KEYWORD) => DisconnectReason::Timeout,
            _ => DisconnectReason::Kicked,
        };
        Some(
            DisconnectEvent {
                session_id: ctx.session_id(),
                player: ctx.player().clone(),
                reason,
                message: disconnect.reason.clone(),
            }
            .into(),
        )
    }

    fn apply_changes(&self, _: &PacketContext, packet: Packet, _: &ProxyEvent) -> Option<Packet> {
        Some(packet)
    }

    fn is_cancelled(&self, _: &ProxyEvent) -> bool {
        false
    }
}

/// Client chat → [`PlayerChatEvent`], or [`PlayerCommandEvent`] for `/` lines.
pub struct ChatMessageMapping;

impl PacketEventMapping for ChatMessageMapping {
    fn kind(&self) -> PacketKind {
        PacketKind::ChatMessage
    }

    fn event_type(&self) -> EventType {
        EventType::PlayerChat
    }

    fn create_event(&self, ctx: &PacketContext, packet: &Packet) -> Option<ProxyEvent> {
        let Packet::ChatMessage(chat) = packet else {
            return None;
        };
        if !ctx.direction.is_client_to_server() {
            return None;
        }
        let message = chat.message.as_deref().filter(|m| !m.is_empty())?;
        let player = ctx.player().clone();
        if message.starts_with(COMMAND_PREFIX) {
            Some(PlayerCommandEvent::parse(ctx.session_id(), player, message).into())
        } else {
            Some(PlayerChatEvent::new(ctx.session_id(), player, message).into())
        }
    }

    fn apply_changes(
        &self,
        _: &PacketContext,
        packet: Packet,
        event: &ProxyEvent,
    ) -> Option<Packet> {
        let mut chat = match packet {
            Packet::ChatMessage(chat) => chat,
            other => return Some(other),
        };
        if let Some(command) = PlayerCommandEvent::from_ref(event) {
            if !command.forward_to_server {
                return None;
            }
            chat.message = Some(command.command_line());
        } else if let Some(event) = PlayerChatEvent::from_ref(event) {
            chat.message = Some(event.message.clone());
        }
        Some(Packet::ChatMessage(chat))
    }
}

/// Backend message to the player → [`ServerMessageEvent`].
pub struct ServerMessageMapping;

impl PacketEventMapping for ServerMessageMapping {
    fn kind(&self) -> PacketKind {
        PacketKind::ServerMessage
    }

    fn event_type(&self) -> EventType {
        EventType::ServerMessage
    }

    fn create_event(&self, ctx: &PacketContext, packet: &Packet) -> Option<ProxyEvent> {
        let Packet::ServerMessage(msg) = packet else {
            return None;
        };
        if !ctx.direction.is_server_to_client() {
            return None;
        }
        Some(
            ServerMessageEvent {
                session_id: ctx.session_id(),
                player: ctx.player().clone(),
                message_type: msg.message_type,
                message: msg.message.clone().unwrap_or_default(),
                cancelled: false,
            }
            .into(),
        )
    }

    fn apply_changes(
        &self,
        _: &PacketContext,
        packet: Packet,
        event: &ProxyEvent,
    ) -> Option<Packet> {
        let mut msg = match packet {
            Packet::ServerMessage(msg) => msg,
            other => return Some(other),
        };
        if let Some(event) = ServerMessageEvent::from_ref(event) {
            if msg.message.as_deref().unwrap_or_default() != event.message {
                msg.message = Some(event.message.clone());
            }
        }
        Some(Packet::ServerMessage(msg))
    }
}

//! Runs every intercepted packet through its mapping and the dispatcher.

use super::{MappingRegistry, PacketContext};
use crate::event::EventDispatcher;
use crate::packets::Packet;
use std::sync::Arc;
use tracing::debug;

/// What to do with an intercepted packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Intercept {
    Forward(Packet),
    Drop,
}

impl Intercept {
    pub fn into_packet(self) -> Option<Packet> {
        match self {
            Intercept::Forward(packet) => Some(packet),
            Intercept::Drop => None,
        }
    }
}

#[derive(Clone)]
pub struct InterceptionPipeline {
    mappings: Arc<MappingRegistry>,
    dispatcher: EventDispatcher,
}

impl InterceptionPipeline {
    pub fn new(mappings: Arc<MappingRegistry>, dispatcher: EventDispatcher) -> Self {
        Self {
            mappings,
            dispatcher,
        }
    }

    pub fn mappings(&self) -> &Arc<MappingRegistry> {
        &self.mappings
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Forward unchanged when no mapping or no event applies. Otherwise fire
    /// the event synchronously and forward whatever the mapping rebuilds.
    pub fn process(&self, ctx: &PacketContext, packet: Packet) -> Intercept {
        let Some(mapping) = self.mappings.get(packet.kind()) else {
            return Intercept::Forward(packet);
        };
        let Some(event) = mapping.create_event(ctx, &packet) else {
            return Intercept::Forward(packet);
        };

        let event = self.dispatcher.fire_sync(event);
        if mapping.is_cancelled(&event) {
            debug!(
                session = ctx.session_id(),
                packet = packet.name(),
                "packet cancelled by event handler"
            );
            return Intercept::Drop;
        }

        match mapping.apply_changes(ctx, packet, &event) {
            Some(packet) => Intercept::Forward(packet),
            None => Intercept::Drop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        priority, Cancellable, DisconnectEvent, DisconnectReason, EventType, LoginEvent,
        PlayerChatEvent, PlayerCommandEvent, ServerMessageEvent,
    };
    use crate::identity::PlayerIdentity;
    use crate::mapping::{Direction, SessionRef};
    use crate::packets::{
        ChatMessage, Connect, Disconnect, DisconnectType, Ping, ServerMessage, ServerMessageType,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn pipeline() -> InterceptionPipeline {
        InterceptionPipeline::new(
            Arc::new(MappingRegistry::with_defaults()),
            EventDispatcher::new(),
        )
    }

    fn ctx(direction: Direction) -> PacketContext {
        PacketContext::new(
            direction,
            SessionRef {
                session_id: 5,
                player: PlayerIdentity::unknown(),
                backend: Some("lobby".into()),
            },
        )
    }

    fn chat(text: &str) -> Packet {
        Packet::ChatMessage(ChatMessage {
            message: Some(text.into()),
        })
    }

    #[test]
    fn unmapped_packet_forwarded_without_event() {
        let p = pipeline();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        p.dispatcher().register("t", EventType::Any, 0, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let ping = Packet::Ping(Ping::default());
        assert_eq!(
            p.process(&ctx(Direction::ClientToServer), ping.clone()),
            Intercept::Forward(ping)
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wrong_direction_declines() {
        let p = pipeline();
        p.dispatcher()
            .subscribe::<PlayerChatEvent, _>("t", 0, |e| {
                e.set_cancelled(true);
                Ok(())
            });
        let packet = chat("hello");
        assert_eq!(
            p.process(&ctx(Direction::ServerToClient), packet.clone()),
            Intercept::Forward(packet)
        );
    }

    #[test]
    fn cancelled_chat_dropped() {
        let p = pipeline();
        p.dispatcher()
            .subscribe::<PlayerChatEvent, _>("filter", priority::NORMAL, |e| {
                if e.message.contains("badword") {
                    e.set_cancelled(true);
                }
                Ok(())
            });
        assert_eq!(
            p.process(&ctx(Direction::ClientToServer), chat("a badword here")),
            Intercept::Drop
        );
        assert!(matches!(
            p.process(&ctx(Direction::ClientToServer), chat("fine")),
            Intercept::Forward(_)
        ));
    }

    #[test]
    fn chat_rewrite_is_forwarded() {
        let p = pipeline();
        p.dispatcher()
            .subscribe::<PlayerChatEvent, _>("caps", priority::NORMAL, |e| {
                e.message = e.message.to_uppercase();
                Ok(())
            });
        assert_eq!(
            p.process(&ctx(Direction::ClientToServer), chat("hello")),
            Intercept::Forward(chat("HELLO"))
        );
    }

    #[test]
    fn empty_chat_has_no_event() {
        let p = pipeline();
        let packet = Packet::ChatMessage(ChatMessage { message: None });
        assert_eq!(
            p.process(&ctx(Direction::ClientToServer), packet.clone()),
            Intercept::Forward(packet)
        );
    }

    #[test]
    fn command_handled_by_proxy_is_dropped() {
        let p = pipeline();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        p.dispatcher()
            .subscribe::<PlayerCommandEvent, _>("cmds", priority::NORMAL, move |e| {
                s.lock().unwrap().push(e.command.clone());
                if e.command == "server" {
                    e.forward_to_server = false;
                }
                Ok(())
            });

        assert_eq!(
            p.process(&ctx(Direction::ClientToServer), chat("/server lobby")),
            Intercept::Drop
        );
        assert_eq!(
            p.process(&ctx(Direction::ClientToServer), chat("/Spawn")),
            Intercept::Forward(chat("/spawn"))
        );
        assert_eq!(*seen.lock().unwrap(), vec!["server", "spawn"]);
    }

    #[test]
    fn denied_login_drops_connect() {
        let p = pipeline();
        p.dispatcher()
            .subscribe::<LoginEvent, _>("bans", priority::FIRST, |e| {
                e.deny("banned");
                Ok(())
            });
        let connect = Packet::Connect(Connect::default());
        assert_eq!(
            p.process(&ctx(Direction::ClientToServer), connect),
            Intercept::Drop
        );
    }

    #[test]
    fn disconnect_reason_classified() {
        let p = pipeline();
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let r = reasons.clone();
        p.dispatcher()
            .subscribe::<DisconnectEvent, _>("t", 0, move |e| {
                r.lock().unwrap().push(e.reason);
                Ok(())
            });
        for text in ["Connection TIMEOUT", "You were kicked"] {
            let packet = Packet::Disconnect(Disconnect {
                disconnect_type: DisconnectType::Disconnect,
                reason: Some(text.into()),
            });
            assert_eq!(
                p.process(&ctx(Direction::ServerToClient), packet.clone()),
                Intercept::Forward(packet)
            );
        }
        assert_eq!(
            *reasons.lock().unwrap(),
            vec![DisconnectReason::Timeout, DisconnectReason::Kicked]
        );
    }

    #[test]
    fn server_message_rewrite_and_cancel() {
        let p = pipeline();
        p.dispatcher()
            .subscribe::<ServerMessageEvent, _>("t", 0, |e| {
                if e.message == "secret" {
                    e.set_cancelled(true);
                } else {
                    e.message = format!("[lobby] {}", e.message);
                }
                Ok(())
            });
        let msg = |text: &str| {
            Packet::ServerMessage(ServerMessage {
                message_type: ServerMessageType::Chat,
                message: Some(text.into()),
            })
        };
        assert_eq!(
            p.process(&ctx(Direction::ServerToClient), msg("secret")),
            Intercept::Drop
        );
        assert_eq!(
            p.process(&ctx(Direction::ServerToClient), msg("welcome")),
            Intercept::Forward(msg("[lobby] welcome"))
        );
    }

    #[test]
    fn unregistered_mapping_passes_through() {
        let p = pipeline();
        assert!(p.mappings().unregister(crate::packets::PacketKind::ChatMessage));
        p.dispatcher()
            .subscribe::<PlayerChatEvent, _>("t", 0, |e| {
                e.set_cancelled(true);
                Ok(())
            });
        let packet = chat("hi");
        assert_eq!(
            p.process(&ctx(Direction::ClientToServer), packet.clone()),
            Intercept::Forward(packet)
        );
        assert_eq!(p.mappings().len(), 3);
    }
}

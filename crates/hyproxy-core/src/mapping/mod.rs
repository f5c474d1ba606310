//! Packet to event mappings.
//!
//! A mapping turns one packet kind into a domain event and folds the
//! (possibly mutated) event back into the packet that gets forwarded.

pub mod defaults;
pub mod pipeline;

use crate::event::{EventType, ProxyEvent};
use crate::identity::PlayerIdentity;
use crate::packets::{Packet, PacketKind};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

pub use pipeline::{Intercept, InterceptionPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn is_client_to_server(self) -> bool {
        self == Direction::ClientToServer
    }

    pub fn is_server_to_client(self) -> bool {
        self == Direction::ServerToClient
    }
}

/// Snapshot of the session a packet belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub session_id: u64,
    pub player: PlayerIdentity,
    pub backend: Option<String>,
}

/// Read-only context handed to mappings for one packet.
#[derive(Debug, Clone)]
pub struct PacketContext {
    pub direction: Direction,
    pub session: SessionRef,
}

impl PacketContext {
    pub fn new(direction: Direction, session: SessionRef) -> Self {
        Self { direction, session }
    }

    pub fn session_id(&self) -> u64 {
        self.session.session_id
    }

    pub fn player(&self) -> &PlayerIdentity {
        &self.session.player
    }
}

/// Conversion strategy for one packet kind.
pub trait PacketEventMapping: Send + Sync {
    fn kind(&self) -> PacketKind;

    /// Primary event kind this mapping produces.
    fn event_type(&self) -> EventType;

    /// Build the event, or `None` to let the packet through untouched.
    fn create_event(&self, ctx: &PacketContext, packet: &Packet) -> Option<ProxyEvent>;

    /// Rebuild the packet from the event. `None` drops it.
    fn apply_changes(&self, ctx: &PacketContext, packet: Packet, event: &ProxyEvent)
        -> Option<Packet>;

    fn is_cancelled(&self, event: &ProxyEvent) -> bool {
        event.is_cancelled()
    }
}

/// Mappings keyed by packet kind. At most one mapping per kind.
#[derive(Default)]
pub struct MappingRegistry {
    mappings: RwLock<HashMap<PacketKind, Arc<dyn PacketEventMapping>>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the login, disconnect, chat and server message mappings.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for mapping in defaults::all() {
            registry.register(mapping);
        }
        registry
    }

    /// Add a mapping, replacing any existing one for the same kind.
    pub fn register(&self, mapping: Arc<dyn PacketEventMapping>) {
        debug!(packet = mapping.kind().name(), event = ?mapping.event_type(), "packet mapping registered");
        self.mappings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(mapping.kind(), mapping);
    }

    pub fn unregister(&self, kind: PacketKind) -> bool {
        self.mappings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind)
            .is_some()
    }

    pub fn get(&self, kind: PacketKind) -> Option<Arc<dyn PacketEventMapping>> {
        self.mappings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned()
    }

    pub fn has_mapping(&self, kind: PacketKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn len(&self) -> usize {
        self.mappings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

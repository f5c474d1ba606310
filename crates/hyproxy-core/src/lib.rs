//! hyproxy-core: protocol library for the hyproxy game proxy.
//!
//! Provides the wire framer, the descriptor-driven packet codec and registry,
//! player identity, domain events with a priority-ordered dispatcher,
//! packet/event mappings with the interception pipeline, local pub/sub
//! messaging and an owner-scoped task scheduler.

pub mod codec;
pub mod error;
pub mod event;
pub mod framer;
pub mod identity;
pub mod mapping;
pub mod messaging;
pub mod packets;
pub mod scheduler;
pub mod varint;

// Re-export commonly used items at crate root.
pub use error::{EventError, ProtocolError, ProtocolResult};
pub use event::{EventDispatcher, EventType, ProxyEvent};
pub use framer::{Decoded, Frame, FrameDecoder};
pub use identity::PlayerIdentity;
pub use mapping::{Direction, Intercept, InterceptionPipeline, MappingRegistry, PacketContext, SessionRef};
pub use messaging::{ChannelMessage, LocalMessaging, MessagingService};
pub use packets::{Packet, PacketKind, PacketRegistry};
pub use scheduler::{Scheduler, TaskHandle};

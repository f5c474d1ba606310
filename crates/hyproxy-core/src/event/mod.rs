//! Domain events, their type hierarchy and the priority-ordered dispatcher.

pub mod dispatcher;
pub mod events;
pub mod types;

pub use dispatcher::{
    EventDispatcher, Handler, HandlerResult, HandlerSpec, Listener, ListenerId, PendingDispatch,
};
pub use events::*;
pub use types::{EventType, EventTypeResolver};

/// Handler priorities. Lower values run first; any `i32` is accepted.
pub mod priority {
    pub const FIRST: i32 = -100;
    pub const EARLY: i32 = -50;
    pub const NORMAL: i32 = 0;
    pub const LATE: i32 = 50;
    pub const LAST: i32 = 100;
}

//! Event kinds and the static "also dispatches as" table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Every kind a handler can register against.
///
/// Concrete kinds are carried by [`ProxyEvent`](super::ProxyEvent) values.
/// `Any` and `PlayerEvent` are abstract parents; `Cancellable` and
/// `Resulted` are capabilities a concrete kind may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    Any,
    PlayerEvent,
    Cancellable,
    Resulted,
    Login,
    PostLogin,
    Disconnect,
    PlayerChat,
    PlayerCommand,
    ServerMessage,
    PlayerTransfer,
    ServerPreConnect,
    ServerConnected,
}

impl EventType {
    pub const CONCRETE: &'static [EventType] = &[
        EventType::Login,
        EventType::PostLogin,
        EventType::Disconnect,
        EventType::PlayerChat,
        EventType::PlayerCommand,
        EventType::ServerMessage,
        EventType::PlayerTransfer,
        EventType::ServerPreConnect,
        EventType::ServerConnected,
    ];

    pub const fn parent(self) -> Option<EventType> {
        match self {
            EventType::Any | EventType::Cancellable | EventType::Resulted => None,
            EventType::PlayerEvent => Some(EventType::Any),
            _ => Some(EventType::PlayerEvent),
        }
    }

    /// Capabilities declared directly by this kind.
    pub const fn capabilities(self) -> &'static [EventType] {
        match self {
            EventType::Login | EventType::PlayerTransfer | EventType::ServerPreConnect => {
                &[EventType::Resulted]
            }
            EventType::PlayerChat | EventType::PlayerCommand | EventType::ServerMessage => {
                &[EventType::Cancellable]
            }
            _ => &[],
        }
    }

    pub fn is_concrete(self) -> bool {
        Self::CONCRETE.contains(&self)
    }
}

/// Computes and caches the dispatch set of each event kind.
#[derive(Debug, Default)]
pub struct EventTypeResolver {
    cache: RwLock<HashMap<EventType, Arc<[EventType]>>>,
}

impl EventTypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The kind itself, then its ancestors, then declared capabilities.
    pub fn resolve(&self, ty: EventType) -> Arc<[EventType]> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ty)
        {
            return hit.clone();
        }
        let resolved: Arc<[EventType]> = compute(ty).into();
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(ty)
            .or_insert(resolved)
            .clone()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn compute(ty: EventType) -> Vec<EventType> {
    let mut chain = vec![ty];
    let mut current = ty;
    while let Some(parent) = current.parent() {
        chain.push(parent);
        current = parent;
    }
    let mut out = chain.clone();
    for t in chain {
        for cap in t.capabilities() {
            if !out.contains(cap) {
                out.push(*cap);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_resolves_to_chain_then_capability() {
        let resolver = EventTypeResolver::new();
        assert_eq!(
            &*resolver.resolve(EventType::Login),
            &[
                EventType::Login,
                EventType::PlayerEvent,
                EventType::Any,
                EventType::Resulted
            ]
        );
    }

    #[test]
    fn abstract_kinds_resolve_to_themselves_and_parents() {
        let resolver = EventTypeResolver::new();
        assert_eq!(
            &*resolver.resolve(EventType::PlayerEvent),
            &[EventType::PlayerEvent, EventType::Any]
        );
        assert_eq!(&*resolver.resolve(EventType::Any), &[EventType::Any]);
    }

    #[test]
    fn results_are_cached() {
        let resolver = EventTypeResolver::new();
        let a = resolver.resolve(EventType::PlayerChat);
        let b = resolver.resolve(EventType::PlayerChat);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(resolver.cached_len(), 1);
    }

    #[test]
    fn no_duplicates() {
        let resolver = EventTypeResolver::new();
        for ty in EventType::CONCRETE {
            let set = resolver.resolve(*ty);
            for (i, t) in set.iter().enumerate() {
                assert!(!set[i + 1..].contains(t), "{ty:?} repeats {t:?}");
            }
            assert_eq!(set[0], *ty);
            assert!(set.contains(&EventType::Any));
        }
    }
}

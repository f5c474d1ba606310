//! Priority-ordered event dispatch.
//!
//! Handlers are registered per [`EventType`]. Firing an event resolves its
//! dispatch set, gathers the handlers of every type in it and runs them in
//! `(priority, registration order)`. Every handler sees the same event
//! instance, so mutations accumulate.

use super::events::{EventKind, ProxyEvent};
use super::types::{EventType, EventTypeResolver};
use crate::error::EventError;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub type Handler = Arc<dyn Fn(&mut ProxyEvent) -> HandlerResult + Send + Sync>;

/// Identifies one registration, or the group created by one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// One handler entry of a listener's registration table.
#[derive(Clone)]
pub struct HandlerSpec {
    pub event_type: EventType,
    pub priority: i32,
    pub receive_cancelled: bool,
    pub handler: Handler,
}

impl HandlerSpec {
    pub fn new<F>(event_type: EventType, priority: i32, handler: F) -> Self
    where
        F: Fn(&mut ProxyEvent) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            event_type,
            priority,
            receive_cancelled: false,
            handler: Arc::new(handler),
        }
    }

    /// Typed handler for one concrete event kind.
    pub fn typed<E, F>(priority: i32, handler: F) -> Self
    where
        E: EventKind,
        F: Fn(&mut E) -> HandlerResult + Send + Sync + 'static,
    {
        Self::new(E::TYPE, priority, move |event| match E::from_mut(event) {
            Some(e) => handler(e),
            None => Ok(()),
        })
    }

    /// Also run when an earlier handler cancelled the event.
    pub fn receive_cancelled(mut self) -> Self {
        self.receive_cancelled = true;
        self
    }
}

impl std::fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("event_type", &self.event_type)
            .field("priority", &self.priority)
            .field("receive_cancelled", &self.receive_cancelled)
            .finish_non_exhaustive()
    }
}

/// An object that declares its handlers as an explicit table.
pub trait Listener {
    fn handlers(&self) -> Vec<HandlerSpec>;
}

struct Registration {
    listener: ListenerId,
    owner: String,
    priority: i32,
    seq: u64,
    receive_cancelled: bool,
    handler: Handler,
}

struct Inner {
    resolver: EventTypeResolver,
    handlers: RwLock<HashMap<EventType, Vec<Arc<Registration>>>>,
    next_seq: AtomicU64,
    shut_down: AtomicBool,
}

/// Shared handle to the dispatcher. Cloning is cheap.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver: EventTypeResolver::new(),
                handlers: RwLock::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Register one handler. Returns an id for [`unregister`](Self::unregister).
    pub fn register<F>(
        &self,
        owner: &str,
        event_type: EventType,
        priority: i32,
        handler: F,
    ) -> ListenerId
    where
        F: Fn(&mut ProxyEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_with(owner, HandlerSpec::new(event_type, priority, handler))
    }

    pub fn register_with(&self, owner: &str, spec: HandlerSpec) -> ListenerId {
        let id = ListenerId(self.inner.next_seq.fetch_add(1, Ordering::Relaxed));
        self.insert(owner, id, spec);
        id
    }

    /// Register every handler a listener declares under one id.
    pub fn register_listener(&self, owner: &str, listener: &impl Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_seq.fetch_add(1, Ordering::Relaxed));
        for spec in listener.handlers() {
            self.insert(owner, id, spec);
        }
        id
    }

    /// Typed registration for a concrete event kind.
    pub fn subscribe<E, F>(&self, owner: &str, priority: i32, handler: F) -> ListenerId
    where
        E: EventKind,
        F: Fn(&mut E) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_with(owner, HandlerSpec::typed::<E, F>(priority, handler))
    }

    fn insert(&self, owner: &str, listener: ListenerId, spec: HandlerSpec) {
        let registration = Arc::new(Registration {
            listener,
            owner: owner.to_string(),
            priority: spec.priority,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            receive_cancelled: spec.receive_cancelled,
            handler: spec.handler,
        });
        let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
        let list = handlers.entry(spec.event_type).or_default();
        list.push(registration);
        list.sort_by_key(|r| (r.priority, r.seq));
        debug!(owner, event = ?spec.event_type, priority = spec.priority, "handler registered");
    }

    /// Remove every handler registered under `listener`. Returns how many were removed.
    pub fn unregister(&self, listener: ListenerId) -> usize {
        self.remove_where(|r| r.listener == listener)
    }

    /// Remove every handler belonging to `owner`.
    pub fn unregister_all(&self, owner: &str) -> usize {
        self.remove_where(|r| r.owner == owner)
    }

    fn remove_where(&self, pred: impl Fn(&Registration) -> bool) -> usize {
        let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|r| !pred(r));
            removed += before - list.len();
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Run every handler for `event` on the calling thread and return it.
    pub fn fire_sync(&self, event: ProxyEvent) -> ProxyEvent {
        match self.inner.dispatch(event, None) {
            Ok(event) => event,
            Err((event, _)) => event,
        }
    }

    /// Dispatch on a blocking worker. The returned handle resolves when all
    /// handlers have run, or earlier if it is cancelled.
    pub fn fire(&self, event: ProxyEvent) -> PendingDispatch {
        let (tx, rx) = oneshot::channel();
        let token = CancellationToken::new();
        if self.inner.shut_down.load(Ordering::Acquire) {
            let _ = tx.send(Err(EventError::ShutDown));
            return PendingDispatch { rx, token };
        }
        let inner = self.inner.clone();
        let child = token.clone();
        tokio::task::spawn_blocking(move || {
            let result = inner.dispatch(event, Some(&child)).map_err(|(_, e)| e);
            let _ = tx.send(result);
        });
        PendingDispatch { rx, token }
    }

    /// Dispatch synchronously and report whether the event survived uncancelled.
    pub fn fire_and_forget(&self, event: ProxyEvent) -> bool {
        !self.fire_sync(event).is_cancelled()
    }

    /// Handlers registered directly under `event_type`.
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    pub fn registered_event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        types.sort();
        types
    }

    /// Drop all handlers and refuse further asynchronous dispatch.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl Inner {
    fn snapshot(&self, event_type: EventType) -> Vec<Arc<Registration>> {
        let types = self.resolver.resolve(event_type);
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut regs: Vec<Arc<Registration>> = types
            .iter()
            .filter_map(|t| handlers.get(t))
            .flatten()
            .cloned()
            .collect();
        regs.sort_by_key(|r| (r.priority, r.seq));
        regs
    }

    fn dispatch(
        &self,
        mut event: ProxyEvent,
        token: Option<&CancellationToken>,
    ) -> Result<ProxyEvent, (ProxyEvent, EventError)> {
        let event_type = event.event_type();
        for reg in self.snapshot(event_type) {
            if token.is_some_and(|t| t.is_cancelled()) {
                return Err((event, EventError::Cancelled));
            }
            if event.is_cancelled() && !reg.receive_cancelled {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (reg.handler)(&mut event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(owner = %reg.owner, event = ?event_type, error = %e, "event handler failed");
                }
                Err(_) => {
                    error!(owner = %reg.owner, event = ?event_type, "event handler panicked");
                }
            }
        }
        Ok(event)
    }
}

/// Completion handle for an asynchronous dispatch.
#[derive(Debug)]
pub struct PendingDispatch {
    rx: oneshot::Receiver<Result<ProxyEvent, EventError>>,
    token: CancellationToken,
}

impl PendingDispatch {
    /// Stop running further handlers. Handlers already running finish.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for dispatch to finish and take the event back.
    pub async fn wait(self) -> Result<ProxyEvent, EventError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(EventError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::events::{
        Cancellable, DisconnectEvent, DisconnectReason, LoginEvent, PlayerChatEvent,
    };
    use crate::event::priority;
    use crate::identity::PlayerIdentity;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn chat(msg: &str) -> ProxyEvent {
        PlayerChatEvent::new(1, PlayerIdentity::unknown(), msg).into()
    }

    fn recorder(
        dispatcher: &EventDispatcher,
        order: &Arc<Mutex<Vec<&'static str>>>,
        ty: EventType,
        prio: i32,
        name: &'static str,
    ) -> ListenerId {
        let order = order.clone();
        dispatcher.register("test", ty, prio, move |_| {
            order.lock().unwrap().push(name);
            Ok(())
        })
    }

    #[test]
    fn test_priority_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        recorder(&dispatcher, &order, EventType::PlayerChat, priority::LAST, "last");
        recorder(&dispatcher, &order, EventType::PlayerChat, priority::FIRST, "first");
        recorder(&dispatcher, &order, EventType::PlayerChat, priority::NORMAL, "normal");

        dispatcher.fire_sync(chat("hi"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "normal", "last"]);
    }

    #[test]
    fn test_ties_keep_registration_order_across_types() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        recorder(&dispatcher, &order, EventType::Any, priority::NORMAL, "any");
        recorder(&dispatcher, &order, EventType::PlayerChat, priority::NORMAL, "chat");
        recorder(&dispatcher, &order, EventType::PlayerEvent, priority::EARLY, "player");
        recorder(&dispatcher, &order, EventType::Cancellable, 7, "cancellable");

        dispatcher.fire_sync(chat("hi"));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["player", "any", "chat", "cancellable"]
        );
    }

    #[test]
    fn test_mutations_accumulate() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe::<PlayerChatEvent, _>("a", priority::EARLY, |e| {
            e.message.push('!');
            Ok(())
        });
        dispatcher.subscribe::<PlayerChatEvent, _>("b", priority::LATE, |e| {
            e.message = e.message.to_uppercase();
            Ok(())
        });
        let out = dispatcher.fire_sync(chat("hey"));
        assert_eq!(PlayerChatEvent::from_event(out).unwrap().message, "HEY!");
    }

    #[test]
    fn test_cancelled_skips_default_handlers() {
        let dispatcher = EventDispatcher::new();
        let plain = Arc::new(AtomicU32::new(0));
        let opted = Arc::new(AtomicU32::new(0));

        dispatcher.subscribe::<PlayerChatEvent, _>("t", priority::FIRST, |e| {
            e.set_cancelled(true);
            Ok(())
        });
        let p = plain.clone();
        dispatcher.register("t", EventType::PlayerChat, priority::NORMAL, move |_| {
            p.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let o = opted.clone();
        dispatcher.register_with(
            "t",
            HandlerSpec::new(EventType::PlayerChat, priority::LAST, move |_| {
                o.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .receive_cancelled(),
        );

        let out = dispatcher.fire_sync(chat("spam"));
        assert!(out.is_cancelled());
        assert_eq!(plain.load(Ordering::SeqCst), 0);
        assert_eq!(opted.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.fire_and_forget(chat("again")));
    }

    #[test]
    fn test_handler_errors_and_panics_are_isolated() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicU32::new(0));
        dispatcher.register("bad", EventType::Login, priority::FIRST, |_| {
            Err("boom".into())
        });
        dispatcher.register("worse", EventType::Login, priority::EARLY, |_| {
            panic!("handler panic")
        });
        let c = counter.clone();
        dispatcher.register("good", EventType::Login, priority::NORMAL, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.fire_sync(LoginEvent::new(1, PlayerIdentity::unknown()).into());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    struct AuditListener {
        hits: Arc<AtomicU32>,
    }

    impl Listener for AuditListener {
        fn handlers(&self) -> Vec<HandlerSpec> {
            let login = self.hits.clone();
            let disconnect = self.hits.clone();
            vec![
                HandlerSpec::typed::<LoginEvent, _>(priority::NORMAL, move |_| {
                    login.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                HandlerSpec::typed::<DisconnectEvent, _>(priority::NORMAL, move |_| {
                    disconnect.fetch_add(10, Ordering::SeqCst);
                    Ok(())
                }),
            ]
        }
    }

    fn disconnect_event() -> ProxyEvent {
        DisconnectEvent {
            session_id: 1,
            player: PlayerIdentity::unknown(),
            reason: DisconnectReason::Disconnected,
            message: None,
        }
        .into()
    }

    #[test]
    fn test_listener_table_and_unregister() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicU32::new(0));
        let id = dispatcher.register_listener("audit", &AuditListener { hits: hits.clone() });
        assert_eq!(
            dispatcher.registered_event_types(),
            vec![EventType::Login, EventType::Disconnect]
        );

        dispatcher.fire_sync(LoginEvent::new(1, PlayerIdentity::unknown()).into());
        dispatcher.fire_sync(disconnect_event());
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert_eq!(dispatcher.unregister(id), 2);
        dispatcher.fire_sync(disconnect_event());
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert!(dispatcher.registered_event_types().is_empty());
    }

    #[test]
    fn test_unregister_all_by_owner() {
        let dispatcher = EventDispatcher::new();
        dispatcher.register("a", EventType::Any, 0, |_| Ok(()));
        dispatcher.register("a", EventType::Login, 0, |_| Ok(()));
        dispatcher.register("b", EventType::Login, 0, |_| Ok(()));
        assert_eq!(dispatcher.unregister_all("a"), 2);
        assert_eq!(dispatcher.handler_count(EventType::Login), 1);
        assert_eq!(dispatcher.handler_count(EventType::Any), 0);
    }

    #[test]
    fn test_unregister_during_dispatch() {
        let dispatcher = EventDispatcher::new();
        let d = dispatcher.clone();
        let counter = Arc::new(AtomicU32::new(0));
        dispatcher.register("self", EventType::Login, priority::FIRST, move |_| {
            d.unregister_all("other");
            Ok(())
        });
        let c = counter.clone();
        dispatcher.register("other", EventType::Login, priority::LAST, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        // the snapshot taken before dispatch still runs the removed handler once
        dispatcher.fire_sync(LoginEvent::new(1, PlayerIdentity::unknown()).into());
        dispatcher.fire_sync(LoginEvent::new(1, PlayerIdentity::unknown()).into());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_fire_completes() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe::<LoginEvent, _>("t", priority::NORMAL, |e| {
            e.deny("full");
            Ok(())
        });
        let pending = dispatcher.fire(LoginEvent::new(9, PlayerIdentity::unknown()).into());
        let event = pending.wait().await.unwrap();
        assert!(!event.is_allowed());
    }

    #[tokio::test]
    async fn test_async_fire_cancelled_before_start() {
        let dispatcher = EventDispatcher::new();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let counter = Arc::new(AtomicU32::new(0));
        dispatcher.register("t", EventType::Login, priority::FIRST, move |_| {
            let _ = gate_rx.lock().unwrap().recv();
            Ok(())
        });
        let c = counter.clone();
        dispatcher.register("t", EventType::Login, priority::LAST, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let pending = dispatcher.fire(LoginEvent::new(1, PlayerIdentity::unknown()).into());
        pending.cancel();
        gate_tx.send(()).unwrap();
        assert_eq!(pending.wait().await.unwrap_err(), EventError::Cancelled);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fire_after_shutdown() {
        let dispatcher = EventDispatcher::new();
        dispatcher.register("t", EventType::Any, 0, |_| Ok(()));
        dispatcher.shutdown();
        assert!(dispatcher.is_shut_down());
        assert_eq!(dispatcher.handler_count(EventType::Any), 0);
        let pending = dispatcher.fire(LoginEvent::new(1, PlayerIdentity::unknown()).into());
        assert_eq!(pending.wait().await.unwrap_err(), EventError::ShutDown);
    }
}

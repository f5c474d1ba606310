//! Concrete event payloads.

use super::types::EventType;
use crate::identity::PlayerIdentity;
use crate::packets::ServerMessageType;

/// Events that may be cancelled by a handler.
pub trait Cancellable {
    fn is_cancelled(&self) -> bool;
    fn set_cancelled(&mut self, cancelled: bool);
}

/// Events carrying an allow/deny outcome.
pub trait Resulted {
    fn is_allowed(&self) -> bool;
}

/// A concrete event kind that can be unwrapped from a [`ProxyEvent`].
pub trait EventKind: Sized + Into<ProxyEvent> {
    const TYPE: EventType;

    fn from_ref(event: &ProxyEvent) -> Option<&Self>;
    fn from_mut(event: &mut ProxyEvent) -> Option<&mut Self>;
    fn from_event(event: ProxyEvent) -> Option<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResult {
    Allowed,
    Denied(String),
}

/// Fired when the client's handshake arrives. Denying it closes the connection.
#[derive(Debug, Clone)]
pub struct LoginEvent {
    pub session_id: u64,
    pub player: PlayerIdentity,
    pub result: LoginResult,
}

impl LoginEvent {
    pub fn new(session_id: u64, player: PlayerIdentity) -> Self {
        Self {
            session_id,
            player,
            result: LoginResult::Allowed,
        }
    }

    pub fn deny(&mut self, reason: impl Into<String>) {
        self.result = LoginResult::Denied(reason.into());
    }

    pub fn denial_reason(&self) -> Option<&str> {
        match &self.result {
            LoginResult::Denied(reason) => Some(reason),
            LoginResult::Allowed => None,
        }
    }
}

impl Resulted for LoginEvent {
    fn is_allowed(&self) -> bool {
        self.result == LoginResult::Allowed
    }
}

/// Fired once the session reaches its first backend.
#[derive(Debug, Clone)]
pub struct PostLoginEvent {
    pub session_id: u64,
    pub player: PlayerIdentity,
    pub backend: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Disconnected,
    Timeout,
    Kicked,
    ServerDisconnect,
    Error,
    Transfer,
}

#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub session_id: u64,
    pub player: PlayerIdentity,
    pub reason: DisconnectReason,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlayerChatEvent {
    pub session_id: u64,
    pub player: PlayerIdentity,
    pub message: String,
    pub cancelled: bool,
}

impl PlayerChatEvent {
    pub fn new(session_id: u64, player: PlayerIdentity, message: impl Into<String>) -> Self {
        Self {
            session_id,
            player,
            message: message.into(),
            cancelled: false,
        }
    }
}

/// A chat line starting with `/`.
#[derive(Debug, Clone)]
pub struct PlayerCommandEvent {
    pub session_id: u64,
    pub player: PlayerIdentity,
    /// Lowercased command name without the slash.
    pub command: String,
    pub args: Vec<String>,
    /// When false the command is consumed by the proxy.
    pub forward_to_server: bool,
    pub cancelled: bool,
}

impl PlayerCommandEvent {
    pub fn parse(session_id: u64, player: PlayerIdentity, line: &str) -> Self {
        let line = line.strip_prefix('/').unwrap_or(line);
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, Some(rest)),
            None => (line, None),
        };
        Self {
            session_id,
            player,
            command: command.to_lowercase(),
            args: rest
                .map(|r| r.split(' ').map(String::from).collect())
                .unwrap_or_default(),
            forward_to_server: true,
            cancelled: false,
        }
    }

    /// The command reassembled with its leading slash.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            format!("/{}", self.command)
        } else {
            format!("/{} {}", self.command, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerMessageEvent {
    pub session_id: u64,
    pub player: PlayerIdentity,
    pub message_type: ServerMessageType,
    pub message: String,
    pub cancelled: bool,
}

/// Outcome of a server-selection event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResult {
    Allowed(String),
    Denied(Option<String>),
}

impl ServerResult {
    pub fn server(&self) -> Option<&str> {
        match self {
            ServerResult::Allowed(name) => Some(name),
            ServerResult::Denied(_) => None,
        }
    }
}

/// Fired before a session is moved to another backend. Handlers may
/// redirect by allowing a different server, or deny with a message.
#[derive(Debug, Clone)]
pub struct PlayerTransferEvent {
    pub session_id: u64,
    pub player: PlayerIdentity,
    pub current: Option<String>,
    pub target: String,
    pub result: ServerResult,
}

impl PlayerTransferEvent {
    pub fn new(
        session_id: u64,
        player: PlayerIdentity,
        current: Option<String>,
        target: impl Into<String>,
    ) -> Self {
        let target = target.into();
        Self {
            session_id,
            player,
            current,
            result: ServerResult::Allowed(target.clone()),
            target,
        }
    }
}

impl Resulted for PlayerTransferEvent {
    fn is_allowed(&self) -> bool {
        matches!(self.result, ServerResult::Allowed(_))
    }
}

/// Fired before the proxy opens an upstream connection.
#[derive(Debug, Clone)]
pub struct ServerPreConnectEvent {
    pub session_id: u64,
    pub player: PlayerIdentity,
    pub original: String,
    pub result: ServerResult,
}

impl ServerPreConnectEvent {
    pub fn new(session_id: u64, player: PlayerIdentity, original: impl Into<String>) -> Self {
        let original = original.into();
        Self {
            session_id,
            player,
            result: ServerResult::Allowed(original.clone()),
            original,
        }
    }
}

impl Resulted for ServerPreConnectEvent {
    fn is_allowed(&self) -> bool {
        matches!(self.result, ServerResult::Allowed(_))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConnectedEvent {
    pub session_id: u64,
    pub player: PlayerIdentity,
    pub backend: String,
    pub previous: Option<String>,
}

macro_rules! cancellable {
    ($($ty:ty),*) => {
        $(
            impl Cancellable for $ty {
                fn is_cancelled(&self) -> bool {
                    self.cancelled
                }
                fn set_cancelled(&mut self, cancelled: bool) {
                    self.cancelled = cancelled;
                }
            }
        )*
    };
}

cancellable!(PlayerChatEvent, PlayerCommandEvent, ServerMessageEvent);

macro_rules! proxy_events {
    ($( $variant:ident($ty:ident) ),* $(,)?) => {
        /// Any event the dispatcher can carry.
        #[derive(Debug, Clone)]
        pub enum ProxyEvent {
            $( $variant($ty), )*
        }

        impl ProxyEvent {
            pub fn event_type(&self) -> EventType {
                match self {
                    $( ProxyEvent::$variant(_) => EventType::$variant, )*
                }
            }

            pub fn session_id(&self) -> u64 {
                match self {
                    $( ProxyEvent::$variant(e) => e.session_id, )*
                }
            }

            pub fn player(&self) -> &PlayerIdentity {
                match self {
                    $( ProxyEvent::$variant(e) => &e.player, )*
                }
            }
        }

        $(
            impl From<$ty> for ProxyEvent {
                fn from(e: $ty) -> Self {
                    ProxyEvent::$variant(e)
                }
            }

            impl EventKind for $ty {
                const TYPE: EventType = EventType::$variant;

                fn from_ref(event: &ProxyEvent) -> Option<&Self> {
                    match event {
                        ProxyEvent::$variant(e) => Some(e),
                        _ => None,
                    }
                }

                fn from_mut(event: &mut ProxyEvent) -> Option<&mut Self> {
                    match event {
                        ProxyEvent::$variant(e) => Some(e),
                        _ => None,
                    }
                }

                fn from_event(event: ProxyEvent) -> Option<Self> {
                    match event {
                        ProxyEvent::$variant(e) => Some(e),
                        _ => None,
                    }
                }
            }
        )*
    };
}

proxy_events! {
    Login(LoginEvent),
    PostLogin(PostLoginEvent),
    Disconnect(DisconnectEvent),
    PlayerChat(PlayerChatEvent),
    PlayerCommand(PlayerCommandEvent),
    ServerMessage(ServerMessageEvent),
    PlayerTransfer(PlayerTransferEvent),
    ServerPreConnect(ServerPreConnectEvent),
    ServerConnected(ServerConnectedEvent),
}

impl ProxyEvent {
    pub fn as_cancellable(&self) -> Option<&dyn Cancellable> {
        match self {
            ProxyEvent::PlayerChat(e) => Some(e),
            ProxyEvent::PlayerCommand(e) => Some(e),
            ProxyEvent::ServerMessage(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_cancellable_mut(&mut self) -> Option<&mut dyn Cancellable> {
        match self {
            ProxyEvent::PlayerChat(e) => Some(e),
            ProxyEvent::PlayerCommand(e) => Some(e),
            ProxyEvent::ServerMessage(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_resulted(&self) -> Option<&dyn Resulted> {
        match self {
            ProxyEvent::Login(e) => Some(e),
            ProxyEvent::PlayerTransfer(e) => Some(e),
            ProxyEvent::ServerPreConnect(e) => Some(e),
            _ => None,
        }
    }

    /// Whether a cancellable event has been cancelled. Always false otherwise.
    pub fn is_cancelled(&self) -> bool {
        self.as_cancellable().is_some_and(|c| c.is_cancelled())
    }

    /// Resulted events report their outcome; all others count as allowed.
    pub fn is_allowed(&self) -> bool {
        self.as_resulted().map_or(true, |r| r.is_allowed())
    }
}

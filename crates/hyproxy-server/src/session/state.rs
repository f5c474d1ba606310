//! Per-session lifecycle state machine.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    AwaitingHandshake = 0,
    CapturingIdentity = 1,
    ExchangingToken = 2,
    EstablishingBackend = 3,
    Active = 4,
    Transferring = 5,
    Closed = 6,
    Failed = 7,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::AwaitingHandshake,
            1 => SessionState::CapturingIdentity,
            2 => SessionState::ExchangingToken,
            3 => SessionState::EstablishingBackend,
            4 => SessionState::Active,
            5 => SessionState::Transferring,
            6 => SessionState::Closed,
            _ => SessionState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Still in the handshake/credential relay phase.
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            SessionState::AwaitingHandshake
                | SessionState::CapturingIdentity
                | SessionState::ExchangingToken
                | SessionState::EstablishingBackend
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | Closed => true,
            CapturingIdentity => self == AwaitingHandshake,
            ExchangingToken => self == CapturingIdentity,
            EstablishingBackend => self == ExchangingToken,
            Active => matches!(self, EstablishingBackend | Transferring),
            Transferring => self == Active,
            AwaitingHandshake => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingHandshake => "awaiting-handshake",
            SessionState::CapturingIdentity => "capturing-identity",
            SessionState::ExchangingToken => "exchanging-token",
            SessionState::EstablishingBackend => "establishing-backend",
            SessionState::Active => "active",
            SessionState::Transferring => "transferring",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lock-free holder for a [`SessionState`].
#[derive(Debug)]
pub struct AtomicSessionState(AtomicU8);

impl AtomicSessionState {
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if the transition is legal from the current state.
    /// Returns the state that was replaced, or the current state on rejection.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = SessionState::from_u8(current);
            if !from.can_transition_to(next) {
                return Err(from);
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let state = AtomicSessionState::new(SessionState::AwaitingHandshake);
        for next in [
            SessionState::CapturingIdentity,
            SessionState::ExchangingToken,
            SessionState::EstablishingBackend,
            SessionState::Active,
            SessionState::Transferring,
            SessionState::Active,
            SessionState::Closed,
        ] {
            assert!(state.transition(next).is_ok(), "to {next}");
        }
        assert!(state.get().is_terminal());
    }

    #[test]
    fn illegal_transitions_rejected() {
        let state = AtomicSessionState::new(SessionState::AwaitingHandshake);
        assert_eq!(
            state.transition(SessionState::Active),
            Err(SessionState::AwaitingHandshake)
        );
        assert_eq!(
            state.transition(SessionState::Transferring),
            Err(SessionState::AwaitingHandshake)
        );
        assert_eq!(state.get(), SessionState::AwaitingHandshake);
    }

    #[test]
    fn terminal_states_are_final() {
        let state = AtomicSessionState::new(SessionState::ExchangingToken);
        assert_eq!(state.transition(SessionState::Failed), Ok(SessionState::ExchangingToken));
        assert!(state.transition(SessionState::Closed).is_err());
        assert!(state.transition(SessionState::Active).is_err());
        assert_eq!(state.get(), SessionState::Failed);
    }

    #[test]
    fn handshaking_classification() {
        assert!(SessionState::EstablishingBackend.is_handshaking());
        assert!(!SessionState::Active.is_handshaking());
        assert!(!SessionState::Transferring.is_handshaking());
    }
}

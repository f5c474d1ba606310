use thiserror::Error;

/// Errors produced while framing or decoding packets.
///
/// Every variant is fatal to the connection that produced it: the framer
/// never attempts to resynchronize a corrupted stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame length {0} out of range")]
    FrameLength(i64),

    #[error("unknown packet id {0}")]
    UnknownPacket(u32),

    #[error("packet {name} ({id}) payload of {len} bytes exceeds max {max}")]
    PacketTooLarge {
        id: u32,
        name: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field}: negative length {len}")]
    NegativeLength { field: &'static str, len: i64 },

    #[error("{field}: string length {len} exceeds max {max}")]
    StringTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field}: {len} elements exceeds max {max}")]
    ArrayTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field}: buffer too small, need {needed} bytes, have {available}")]
    BufferTooSmall {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{field}: invalid enum index {index}")]
    InvalidEnum { field: &'static str, index: u8 },

    #[error("{field}: duplicate map key")]
    DuplicateMapKey { field: &'static str },

    #[error("{field}: invalid variable offset {offset}")]
    InvalidOffset { field: &'static str, offset: i32 },

    #[error("{field}: invalid string data")]
    InvalidString { field: &'static str },

    #[error("{field}: required field missing")]
    MissingField { field: &'static str },

    #[error("{field}: value does not match its descriptor")]
    TypeMismatch { field: &'static str },

    #[error("VarInt exceeds maximum length (5 bytes)")]
    VarIntTooLong,

    #[error("decoder poisoned by an earlier framing error")]
    Poisoned,
}

impl ProtocolError {
    /// Whether this error came from a payload schema rather than the frame header.
    pub fn is_schema_error(&self) -> bool {
        !matches!(
            self,
            ProtocolError::FrameLength(_)
                | ProtocolError::UnknownPacket(_)
                | ProtocolError::PacketTooLarge { .. }
                | ProtocolError::Poisoned
        )
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors surfaced by asynchronous event dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("dispatch cancelled")]
    Cancelled,

    #[error("event dispatcher shut down")]
    ShutDown,

    #[error("handler failed: {0}")]
    Handler(String),
}

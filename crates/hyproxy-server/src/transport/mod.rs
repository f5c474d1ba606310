//! QUIC transport for both sides of the proxy.

pub mod quic;

pub use quic::{IncomingClient, StreamEvent, ALPN};

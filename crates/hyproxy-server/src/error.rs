use hyproxy_core::ProtocolError;
use thiserror::Error;

/// Errors produced by the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("session closed")]
    SessionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Failures talking to the identity service.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Connection failure, timeout or a 5xx answer.
    #[error("network error: {0}")]
    Network(String),

    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Network(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return AuthError::InvalidResponse(e.to_string());
        }
        match e.status() {
            Some(status) if !status.is_server_error() => AuthError::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            },
            _ => AuthError::Network(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_retry() {
        assert!(AuthError::Network("reset".into()).is_retryable());
        assert!(!AuthError::NotAuthenticated.is_retryable());
        assert!(!AuthError::InvalidResponse("bad json".into()).is_retryable());
        assert!(!AuthError::Rejected {
            status: 403,
            message: "forbidden".into()
        }
        .is_retryable());
    }

    #[test]
    fn protocol_error_converts() {
        let err: ProxyError = ProtocolError::UnknownPacket(7).into();
        assert!(matches!(err, ProxyError::Protocol(_)));
        assert!(err.to_string().starts_with("protocol error"));
    }
}

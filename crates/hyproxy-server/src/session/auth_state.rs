//! Credential material captured while a session authenticates.

use hyproxy_core::packets::Connect;

/// Per-session authentication data.
///
/// The handshake and certificate fingerprint stay for the life of the
/// session since backend transfers replay them. Grants and tokens are only
/// needed until the session is active and are purged then.
#[derive(Debug, Default, Clone)]
pub struct SessionAuthState {
    pub client_fingerprint: Option<String>,
    pub handshake: Option<Connect>,
    pub client_grant: Option<String>,
    pub client_access_token: Option<String>,
    pub backend_access_token: Option<String>,
    pub backend_server_grant: Option<String>,
}

impl SessionAuthState {
    pub fn new(client_fingerprint: Option<String>) -> Self {
        Self {
            client_fingerprint,
            ..Default::default()
        }
    }

    /// Drop every grant and token. Keeps the handshake and fingerprint.
    pub fn clear_sensitive_data(&mut self) {
        self.client_grant = None;
        self.client_access_token = None;
        self.backend_access_token = None;
        self.backend_server_grant = None;
    }

    pub fn has_sensitive_data(&self) -> bool {
        self.client_grant.is_some()
            || self.client_access_token.is_some()
            || self.backend_access_token.is_some()
            || self.backend_server_grant.is_some()
    }
}

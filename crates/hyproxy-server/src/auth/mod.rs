//! Player authentication and the proxy's own identity-service credentials.

pub mod credentials;
pub mod oauth;
pub mod relay;
pub mod retry;
pub mod service;

pub use credentials::{CredentialStore, StoredCredential};
pub use oauth::{DeviceCode, DeviceFlow, GameSession, GameSessionManager, TokenRefresher};
pub use relay::{CredentialRelay, RelayError};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use service::{GrantSubject, HttpSessionService, SessionService};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::time::Duration;

pub const CLIENT_ID: &str = "hytale-server";
pub const SCOPES: &[&str] = &["openid", "offline", "auth:server"];
pub const USER_AGENT: &str = concat!("hyproxy/", env!("CARGO_PKG_VERSION"));
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// SHA-256 of a DER certificate, URL-safe base64 without padding.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    URL_SAFE_NO_PAD.encode(digest)
}

/// The `aud` claim of a JWT, falling back to `sub`. The signature is not checked.
pub fn token_audience(token: &str) -> Option<String> {
    let mut parts = token.split('.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let aud = match claims.get("aud") {
        Some(serde_json::Value::String(aud)) => Some(aud.clone()),
        Some(serde_json::Value::Array(list)) => list.first().and_then(|v| v.as_str()).map(String::from),
        _ => None,
    };
    aud.or_else(|| claims.get("sub")?.as_str().map(String::from))
}

/// HTTP client shared by every identity-service call.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

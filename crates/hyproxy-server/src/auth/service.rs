//! Client for the identity provider's session service.
//!
//! The proxy talks to `/server-join/*` on behalf of each player, authenticated
//! with its own game session. The [`SessionService`] trait is the seam the
//! credential relay is written against.

use super::oauth::GameSessionManager;
use crate::error::AuthError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub type AuthFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AuthError>> + Send + 'a>>;

/// Who an authorization grant is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantSubject<'a> {
    IdentityToken(&'a str),
    /// Used when the client sent no identity token.
    Uuid(Uuid),
}

pub trait SessionService: Send + Sync {
    /// Whether the proxy currently holds a game session.
    fn is_authenticated(&self) -> bool;

    /// The proxy's own identity token, handed to clients with their grant.
    fn identity_token(&self) -> Option<String>;

    /// Authorization grant for a player joining through this proxy.
    fn request_auth_grant<'a>(
        &'a self,
        subject: GrantSubject<'a>,
        fingerprint: Option<&'a str>,
    ) -> AuthFuture<'a, String>;

    /// Trade an authorization grant for an access token.
    fn exchange_auth_grant<'a>(
        &'a self,
        grant: &'a str,
        fingerprint: Option<&'a str>,
    ) -> AuthFuture<'a, String>;

    /// Grant proving the proxy to a backend that sent `identity_token`.
    fn request_server_auth_grant<'a>(
        &'a self,
        identity_token: &'a str,
        audience: &'a str,
    ) -> AuthFuture<'a, String>;
}

pub(crate) fn grant_request_body(subject: GrantSubject<'_>, fingerprint: Option<&str>) -> Value {
    let mut body = Map::new();
    match subject {
        GrantSubject::IdentityToken(token) => {
            body.insert("identityToken".into(), token.into());
        }
        GrantSubject::Uuid(uuid) => {
            body.insert("uuid".into(), uuid.to_string().into());
        }
    }
    if let Some(fp) = fingerprint {
        body.insert("x509Fingerprint".into(), fp.into());
    }
    Value::Object(body)
}

pub(crate) fn token_request_body(grant: &str, fingerprint: Option<&str>) -> Value {
    let mut body = json!({ "authorizationGrant": grant });
    if let Some(fp) = fingerprint {
        body["x509Fingerprint"] = fp.into();
    }
    body
}

pub(crate) fn server_grant_body(identity_token: &str, audience: &str) -> Value {
    json!({ "identityToken": identity_token, "aud": audience })
}

/// Decode a JSON answer. 5xx is a network failure, any other non-2xx a rejection.
pub(crate) async fn json_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AuthError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(AuthError::Network(format!(
            "{} answered {status}",
            response.url().path()
        )));
    }
    if !status.is_success() {
        let mut message = response.text().await.unwrap_or_default();
        message.truncate(200);
        return Err(AuthError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::InvalidResponse(e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantResponse {
    authorization_grant: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: Option<String>,
}

/// [`SessionService`] over HTTPS.
pub struct HttpSessionService {
    http: reqwest::Client,
    base_url: String,
    game_session: Arc<GameSessionManager>,
}

impl HttpSessionService {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        game_session: Arc<GameSessionManager>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            game_session,
        }
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, AuthError> {
        let token = self
            .game_session
            .session_token()
            .ok_or(AuthError::NotAuthenticated)?;
        debug!(path, "session service request");
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;
        json_response(response).await
    }

    async fn grant(&self, body: Value) -> Result<String, AuthError> {
        let response: GrantResponse = self.post("/server-join/auth-grant", &body).await?;
        response
            .authorization_grant
            .ok_or_else(|| AuthError::InvalidResponse("missing authorizationGrant".into()))
    }
}

impl SessionService for HttpSessionService {
    fn is_authenticated(&self) -> bool {
        self.game_session.is_authenticated()
    }

    fn identity_token(&self) -> Option<String> {
        self.game_session.identity_token()
    }

    fn request_auth_grant<'a>(
        &'a self,
        subject: GrantSubject<'a>,
        fingerprint: Option<&'a str>,
    ) -> AuthFuture<'a, String> {
        Box::pin(self.grant(grant_request_body(subject, fingerprint)))
    }

    fn exchange_auth_grant<'a>(
        &'a self,
        grant: &'a str,
        fingerprint: Option<&'a str>,
    ) -> AuthFuture<'a, String> {
        Box::pin(async move {
            let body = token_request_body(grant, fingerprint);
            let response: TokenResponse = self.post("/server-join/auth-token", &body).await?;
            response
                .access_token
                .ok_or_else(|| AuthError::InvalidResponse("missing accessToken".into()))
        })
    }

    fn request_server_auth_grant<'a>(
        &'a self,
        identity_token: &'a str,
        audience: &'a str,
    ) -> AuthFuture<'a, String> {
        Box::pin(self.grant(server_grant_body(identity_token, audience)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_body_prefers_identity_token() {
        let body = grant_request_body(GrantSubject::IdentityToken("jwt"), Some("fp"));
        assert_eq!(body, json!({"identityToken": "jwt", "x509Fingerprint": "fp"}));

        let uuid = Uuid::new_v4();
        let body = grant_request_body(GrantSubject::Uuid(uuid), None);
        assert_eq!(body, json!({"uuid": uuid.to_string()}));
    }

    #[test]
    fn token_and_server_grant_bodies() {
        assert_eq!(
            token_request_body("grant", Some("fp")),
            json!({"authorizationGrant": "grant", "x509Fingerprint": "fp"})
        );
        assert_eq!(token_request_body("grant", None), json!({"authorizationGrant": "grant"}));
        assert_eq!(
            server_grant_body("server-jwt", "server-1"),
            json!({"identityToken": "server-jwt", "aud": "server-1"})
        );
    }

    #[test]
    fn response_field_names() {
        let grant: GrantResponse = serde_json::from_str(r#"{"authorizationGrant":"g"}"#).unwrap();
        assert_eq!(grant.authorization_grant.as_deref(), Some("g"));
        let token: TokenResponse = serde_json::from_str(r#"{"accessToken":"t","extra":1}"#).unwrap();
        assert_eq!(token.access_token.as_deref(), Some("t"));
    }
}

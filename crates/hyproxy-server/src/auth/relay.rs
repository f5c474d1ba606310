//! Credential relay between a player, the identity service and a backend.
//!
//! The proxy terminates the client's QUIC connection, so neither side can
//! complete the join handshake with the other directly. Each half is
//! answered with credentials the proxy obtains from the session service.

use super::retry::{retry_with_backoff, RetryPolicy};
use super::service::{GrantSubject, SessionService};
use super::token_audience;
use crate::error::AuthError;
use crate::session::ProxySession;
use hyproxy_core::packets::{AuthGrant, AuthToken, Connect, ServerAuthToken};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid access token")]
    InvalidAccessToken,

    #[error("Backend sent no authorization grant")]
    MissingGrant,

    #[error("Server authentication unavailable")]
    NotAuthenticated,

    #[error("Authentication failed: {0}")]
    Service(#[from] AuthError),
}

#[derive(Clone)]
pub struct CredentialRelay {
    service: Arc<dyn SessionService>,
    retry: RetryPolicy,
    proxy_fingerprint: Option<String>,
}

impl CredentialRelay {
    pub fn new(
        service: Arc<dyn SessionService>,
        retry: RetryPolicy,
        proxy_fingerprint: Option<String>,
    ) -> Self {
        Self {
            service,
            retry,
            proxy_fingerprint,
        }
    }

    pub fn proxy_fingerprint(&self) -> Option<&str> {
        self.proxy_fingerprint.as_deref()
    }

    fn ensure_authenticated(&self) -> Result<(), RelayError> {
        if self.service.is_authenticated() {
            Ok(())
        } else {
            Err(RelayError::NotAuthenticated)
        }
    }

    /// Obtain the grant answering a client's Connect.
    pub async fn grant_for_client(
        &self,
        session: &ProxySession,
        connect: &Connect,
    ) -> Result<AuthGrant, RelayError> {
        self.ensure_authenticated()?;
        let subject = match connect.identity_token.as_deref() {
            Some(token) if !token.is_empty() => GrantSubject::IdentityToken(token),
            _ => GrantSubject::Uuid(connect.uuid),
        };
        let service = &*self.service;
        let fingerprint = self.proxy_fingerprint();
        let grant = retry_with_backoff(&self.retry, "auth-grant", || {
            service.request_auth_grant(subject, fingerprint)
        })
        .await?;

        info!(session = session.id(), player = %connect.username, "auth grant obtained");
        session.with_auth(|auth| auth.client_grant = Some(grant.clone()));
        Ok(AuthGrant {
            authorization_grant: Some(grant),
            server_identity_token: service.identity_token(),
        })
    }

    /// Accept the client's AuthToken. When the client asked the proxy to
    /// prove itself, the returned packet carries the proxy's access token.
    pub async fn accept_client_token(
        &self,
        session: &ProxySession,
        token: &AuthToken,
    ) -> Result<ServerAuthToken, RelayError> {
        let access = token
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(RelayError::InvalidAccessToken)?;
        session.with_auth(|auth| auth.client_access_token = Some(access.to_string()));

        let server_access_token = match token.server_authorization_grant.as_deref() {
            Some(grant) if !grant.is_empty() => {
                self.ensure_authenticated()?;
                let service = &*self.service;
                let fingerprint = self.proxy_fingerprint();
                Some(
                    retry_with_backoff(&self.retry, "auth-token", || {
                        service.exchange_auth_grant(grant, fingerprint)
                    })
                    .await?,
                )
            }
            _ => None,
        };

        debug!(
            session = session.id(),
            mutual = server_access_token.is_some(),
            "client token accepted"
        );
        Ok(ServerAuthToken {
            server_access_token,
            password_challenge: None,
        })
    }

    /// Answer a backend's AuthGrant as if the proxy were the player.
    pub async fn answer_backend_grant(
        &self,
        session: &ProxySession,
        grant: &AuthGrant,
    ) -> Result<AuthToken, RelayError> {
        let authorization = grant
            .authorization_grant
            .as_deref()
            .filter(|g| !g.is_empty())
            .ok_or(RelayError::MissingGrant)?;
        self.ensure_authenticated()?;

        let service = &*self.service;
        let fingerprint = self.proxy_fingerprint();
        let access = retry_with_backoff(&self.retry, "backend-auth-token", || {
            service.exchange_auth_grant(authorization, fingerprint)
        })
        .await?;

        let server_grant = match grant.server_identity_token.as_deref() {
            Some(identity) if !identity.is_empty() => {
                let audience = token_audience(identity).unwrap_or_default();
                Some(
                    retry_with_backoff(&self.retry, "server-auth-grant", || {
                        service.request_server_auth_grant(identity, &audience)
                    })
                    .await?,
                )
            }
            _ => None,
        };

        session.with_auth(|auth| {
            auth.backend_access_token = Some(access.clone());
            auth.backend_server_grant = server_grant.clone();
        });
        debug!(session = session.id(), "backend grant answered");
        Ok(AuthToken {
            access_token: Some(access),
            server_authorization_grant: server_grant,
        })
    }
}

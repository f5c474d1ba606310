//! The proxy's own OAuth credential: device-code login, refresh-token
//! grants and the game session derived from them.

use super::credentials::CredentialStore;
use super::service::json_response;
use super::{CLIENT_ID, SCOPES};
use crate::config::AuthSettings;
use crate::error::AuthError;
use chrono::{DateTime, Utc};
use hyproxy_core::{Scheduler, TaskHandle};
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const MIN_POLL_INTERVAL: u64 = 5;
const SLOW_DOWN_STEP: u64 = 5;
const DEFAULT_TOKEN_LIFETIME: i64 = 3600;
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(60);
const REFRESH_OWNER: &str = "game-session";

fn default_device_expiry() -> u64 {
    600
}

fn default_poll_interval() -> u64 {
    MIN_POLL_INTERVAL
}

/// Device authorization response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    #[serde(default = "default_device_expiry")]
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
enum PollOutcome {
    Complete(TokenResponse),
    Pending,
    SlowDown,
    Failed(String),
}

fn classify_poll(success: bool, response: TokenResponse) -> PollOutcome {
    if success && response.access_token.is_some() {
        return PollOutcome::Complete(response);
    }
    match response.error.as_deref() {
        Some("authorization_pending") => PollOutcome::Pending,
        Some("slow_down") => PollOutcome::SlowDown,
        Some(other) => PollOutcome::Failed(other.to_string()),
        None => PollOutcome::Failed("token endpoint returned no access token".into()),
    }
}

/// Write a token response into `store`. A missing refresh token keeps the old one.
fn apply_tokens(store: &CredentialStore, response: TokenResponse, now: i64) {
    let lifetime = response.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME);
    store.update(|c| {
        c.oauth_access_token = response.access_token;
        if let Some(refresh) = response.refresh_token.filter(|t| !t.is_empty()) {
            c.oauth_refresh_token = Some(refresh);
        }
        c.oauth_expiry = Some(now + lifetime);
    });
}

fn persist(store: &CredentialStore) {
    if let Err(e) = store.save() {
        error!(path = %store.path().display(), error = %e, "failed to save credentials");
    }
}

/// Keeps the stored OAuth access token valid.
#[derive(Clone)]
pub struct TokenRefresher {
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    token_url: String,
    margin: Duration,
}

impl TokenRefresher {
    pub fn new(
        http: reqwest::Client,
        store: Arc<CredentialStore>,
        token_url: impl Into<String>,
        margin: Duration,
    ) -> Self {
        Self {
            http,
            store,
            token_url: token_url.into(),
            margin,
        }
    }

    /// Refresh unless the access token outlives the refresh margin.
    pub async fn refresh_if_needed(&self) -> Result<(), AuthError> {
        if !self.store.has_refresh_token() {
            return Err(AuthError::NotAuthenticated);
        }
        if self.store.snapshot().is_fresh(Utc::now().timestamp(), self.margin) {
            debug!("oauth token still valid");
            return Ok(());
        }
        self.force_refresh().await
    }

    pub async fn force_refresh(&self) -> Result<(), AuthError> {
        let refresh_token = self
            .store
            .snapshot()
            .oauth_refresh_token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::NotAuthenticated)?;

        info!("refreshing oauth token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", CLIENT_ID),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;
        let tokens: TokenResponse = json_response(response).await?;
        if tokens.access_token.is_none() {
            return Err(AuthError::InvalidResponse(
                "refresh response has no access_token".into(),
            ));
        }

        apply_tokens(&self.store, tokens, Utc::now().timestamp());
        persist(&self.store);
        info!("oauth token refreshed");
        Ok(())
    }
}

/// Interactive device-code login used when no credential is stored.
pub struct DeviceFlow {
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    device_url: String,
    token_url: String,
}

impl DeviceFlow {
    pub fn new(
        http: reqwest::Client,
        store: Arc<CredentialStore>,
        device_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            store,
            device_url: device_url.into(),
            token_url: token_url.into(),
        }
    }

    pub async fn start_device_flow(&self) -> Result<DeviceCode, AuthError> {
        info!("starting oauth device code flow");
        let scope = SCOPES.join(" ");
        let response = self
            .http
            .post(&self.device_url)
            .form(&[("client_id", CLIENT_ID), ("scope", scope.as_str())])
            .send()
            .await?;
        let code: DeviceCode = json_response(response).await?;
        info!(user_code = %code.user_code, "device code obtained");
        Ok(code)
    }

    /// Poll until the user approves, denies or the code expires.
    pub async fn poll_device_flow(&self, code: &DeviceCode) -> Result<(), AuthError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(code.expires_in);
        let mut interval = code.interval.max(MIN_POLL_INTERVAL);

        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::Rejected {
                    status: 400,
                    message: "device code expired".into(),
                });
            }

            let response = self
                .http
                .post(&self.token_url)
                .form(&[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", CLIENT_ID),
                    ("device_code", code.device_code.as_str()),
                ])
                .send()
                .await?;
            let status = response.status();
            if status.is_server_error() {
                warn!(status = status.as_u16(), "token endpoint unavailable, polling again");
                continue;
            }
            let body: TokenResponse = response.json().await?;

            match classify_poll(status.is_success(), body) {
                PollOutcome::Complete(tokens) => {
                    apply_tokens(&self.store, tokens, Utc::now().timestamp());
                    persist(&self.store);
                    info!("oauth device login complete");
                    return Ok(());
                }
                PollOutcome::Pending => {}
                PollOutcome::SlowDown => {
                    interval += SLOW_DOWN_STEP;
                    debug!(interval, "token endpoint asked to slow down");
                }
                PollOutcome::Failed(reason) => {
                    return Err(AuthError::Rejected {
                        status: status.as_u16(),
                        message: reason,
                    });
                }
            }
        }
    }
}

/// Tokens for talking to the session service as this proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSession {
    pub session_token: String,
    pub identity_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    uuid: Uuid,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProfilesResponse {
    #[serde(default)]
    profiles: Vec<Profile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameSessionResponse {
    session_token: Option<String>,
    identity_token: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
}

impl GameSessionResponse {
    fn into_session(self) -> Result<GameSession, AuthError> {
        let session_token = self
            .session_token
            .ok_or_else(|| AuthError::InvalidResponse("missing sessionToken".into()))?;
        let identity_token = self
            .identity_token
            .ok_or_else(|| AuthError::InvalidResponse("missing identityToken".into()))?;
        let expires_at = self.expires_at.as_deref().and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| warn!(value = raw, error = %e, "unparseable session expiry"))
                .ok()
        });
        Ok(GameSession {
            session_token,
            identity_token,
            expires_at,
        })
    }
}

/// The stored profile if it is still offered, else the first one.
fn select_profile(profiles: &[Profile], preferred: Option<Uuid>) -> Option<&Profile> {
    preferred
        .and_then(|uuid| profiles.iter().find(|p| p.uuid == uuid))
        .or_else(|| profiles.first())
}

/// How long to wait before renewing a session expiring at `expires_at`.
fn refresh_delay_for(expires_at: DateTime<Utc>, now: DateTime<Utc>, margin: Duration) -> Duration {
    let remaining = (expires_at - now).num_seconds() - margin.as_secs() as i64;
    Duration::from_secs(remaining.max(0) as u64).max(MIN_REFRESH_DELAY)
}

/// Owns the proxy's game session and renews it before it expires.
pub struct GameSessionManager {
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    refresher: TokenRefresher,
    settings: AuthSettings,
    current: RwLock<Option<GameSession>>,
}

impl GameSessionManager {
    pub fn new(http: reqwest::Client, store: Arc<CredentialStore>, settings: &AuthSettings) -> Self {
        let refresher = TokenRefresher::new(
            http.clone(),
            store.clone(),
            settings.oauth_token_url.clone(),
            settings.refresh_margin,
        );
        Self {
            http,
            store,
            refresher,
            settings: settings.clone(),
            current: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn refresher(&self) -> &TokenRefresher {
        &self.refresher
    }

    pub fn device_flow(&self) -> DeviceFlow {
        DeviceFlow::new(
            self.http.clone(),
            self.store.clone(),
            self.settings.oauth_device_url.clone(),
            self.settings.oauth_token_url.clone(),
        )
    }

    /// Make sure an OAuth credential exists, running the device flow when
    /// there is none, then open a game session. `on_code` is shown the
    /// device code the operator has to approve.
    pub async fn login(&self, on_code: impl FnOnce(&DeviceCode)) -> Result<GameSession, AuthError> {
        match self.refresher.refresh_if_needed().await {
            Ok(()) => {}
            Err(AuthError::NotAuthenticated) => {
                let flow = self.device_flow();
                let code = flow.start_device_flow().await?;
                on_code(&code);
                flow.poll_device_flow(&code).await?;
            }
            Err(e) => return Err(e),
        }
        self.create_session().await
    }

    pub async fn create_session(&self) -> Result<GameSession, AuthError> {
        self.refresher.refresh_if_needed().await?;
        let access = self.store.access_token().ok_or(AuthError::NotAuthenticated)?;

        let response = self
            .http
            .get(format!("{}/my-account/get-profiles", self.settings.account_data_url))
            .bearer_auth(&access)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let profiles: ProfilesResponse = json_response(response).await?;

        let preferred = self.store.snapshot().profile_uuid;
        let profile = select_profile(&profiles.profiles, preferred)
            .ok_or_else(|| AuthError::InvalidResponse("account has no game profiles".into()))?;
        let (uuid, username) = (profile.uuid, profile.username.clone());
        if preferred != Some(uuid) {
            self.store.update(|c| {
                c.profile_uuid = Some(uuid);
                c.profile_username = username.clone();
            });
            persist(&self.store);
        }

        let response = self
            .http
            .post(format!("{}/game-session/new", self.settings.session_service_url))
            .bearer_auth(&access)
            .json(&serde_json::json!({ "uuid": uuid }))
            .send()
            .await?;
        let session = json_response::<GameSessionResponse>(response)
            .await?
            .into_session()?;

        info!(
            profile = %uuid,
            username = username.as_deref().unwrap_or("?"),
            expires_at = ?session.expires_at,
            "game session created"
        );
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        Ok(session)
    }

    pub fn current(&self) -> Option<GameSession> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current().is_some()
    }

    pub fn session_token(&self) -> Option<String> {
        self.current().map(|s| s.session_token)
    }

    pub fn identity_token(&self) -> Option<String> {
        self.current().map(|s| s.identity_token)
    }

    /// Delay until the current session should be renewed. `None` when the
    /// session carries no expiry.
    pub fn refresh_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        let expires_at = self.current()?.expires_at?;
        Some(refresh_delay_for(expires_at, now, self.settings.refresh_margin))
    }

    /// Renew the game session in the background until the scheduler
    /// cancels the `game-session` owner.
    pub fn spawn_refresh_loop(self: &Arc<Self>, scheduler: &Scheduler) -> TaskHandle {
        let manager = self.clone();
        scheduler.run_async(REFRESH_OWNER, async move {
            loop {
                let Some(delay) = manager.refresh_delay(Utc::now()) else {
                    debug!("game session has no expiry, refresh loop idle");
                    return;
                };
                debug!(delay_secs = delay.as_secs(), "next game session refresh scheduled");
                tokio::time::sleep(delay).await;
                if let Err(e) = manager.create_session().await {
                    error!(error = %e, "game session refresh failed");
                    tokio::time::sleep(MIN_REFRESH_DELAY).await;
                }
            }
        })
    }
}

//! The proxy's persisted OAuth credential.

use crate::error::{ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// On-disk JSON layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_refresh_token: Option<String>,
    /// Epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_expiry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_username: Option<String>,
}

impl StoredCredential {
    /// Whether the access token is still good `margin` from `now` (epoch seconds).
    pub fn is_fresh(&self, now: i64, margin: Duration) -> bool {
        match (&self.oauth_access_token, self.oauth_expiry) {
            (Some(_), Some(expiry)) => expiry > now + margin.as_secs() as i64,
            _ => false,
        }
    }
}

pub struct CredentialStore {
    path: PathBuf,
    state: RwLock<StoredCredential>,
}

impl CredentialStore {
    /// Load from `path`. A missing or unreadable file yields an empty store.
    pub fn load(path: &Path) -> Self {
        let state = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<StoredCredential>(&content) {
                Ok(credential) => {
                    info!(path = %path.display(), "loaded stored credentials");
                    credential
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "credential file unreadable, ignoring");
                    StoredCredential::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no stored credentials");
                StoredCredential::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read credential file");
                StoredCredential::default()
            }
        };
        Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> StoredCredential {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut StoredCredential)) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
    }

    pub fn access_token(&self) -> Option<String> {
        self.snapshot().oauth_access_token
    }

    pub fn has_refresh_token(&self) -> bool {
        self.snapshot()
            .oauth_refresh_token
            .is_some_and(|t| !t.is_empty())
    }

    /// Persist the current state. The file is only readable by its owner on unix.
    pub fn save(&self) -> ProxyResult<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| ProxyError::Other(format!("credential serialization failed: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!(path = %self.path.display(), "credentials saved");
        Ok(())
    }
}

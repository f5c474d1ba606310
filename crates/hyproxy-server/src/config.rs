//! Proxy configuration: TOML file + CLI overrides.

use crate::error::{ProxyError, ProxyResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Address advertised to clients in transfer referrals.
    #[serde(default)]
    pub public_address: Option<String>,
    /// 0 means "same as bind_port".
    #[serde(default)]
    pub public_port: u16,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default)]
    pub debug: bool,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            public_address: None,
            public_port: 0,
            cert: default_cert_path(),
            key: default_key_path(),
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
            debug: false,
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_session_service_url")]
    pub session_service_url: String,
    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: String,
    #[serde(default = "default_oauth_device_url")]
    pub oauth_device_url: String,
    #[serde(default = "default_account_data_url")]
    pub account_data_url: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            refresh_margin_secs: default_refresh_margin(),
            session_service_url: default_session_service_url(),
            oauth_token_url: default_oauth_token_url(),
            oauth_device_url: default_oauth_device_url(),
            account_data_url: default_account_data_url(),
        }
    }
}

/// `[transfer]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_referral_expiry")]
    pub referral_expiry_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            referral_expiry_secs: default_referral_expiry(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

/// One `[[backends]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub default: bool,
}

impl BackendConfig {
    pub fn new(name: &str, host: &str, port: u16, default: bool) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            default,
        }
    }

    /// `host:port`, suitable for DNS lookup.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_bind_port() -> u16 {
    24322
}
fn default_cert_path() -> String {
    "~/.hyproxy/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.hyproxy/key.pem".to_string()
}
fn default_max_connections() -> usize {
    1000
}
fn default_connection_timeout() -> u64 {
    30
}
fn default_credentials_path() -> String {
    "~/.hyproxy/credentials.json".to_string()
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    500
}
fn default_refresh_margin() -> u64 {
    300
}
fn default_session_service_url() -> String {
    "https://sessions.hytale.com".to_string()
}
fn default_oauth_token_url() -> String {
    "https://oauth.accounts.hytale.com/oauth2/token".to_string()
}
fn default_oauth_device_url() -> String {
    "https://oauth.accounts.hytale.com/oauth2/device/auth".to_string()
}
fn default_account_data_url() -> String {
    "https://account-data.hytale.com".to_string()
}
fn default_referral_expiry() -> u64 {
    30
}
fn default_probe_timeout() -> u64 {
    1500
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub public_address: Option<String>,
}

/// Identity-service and credential settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub credentials_path: PathBuf,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub refresh_margin: Duration,
    pub session_service_url: String,
    pub oauth_token_url: String,
    pub oauth_device_url: String,
    pub account_data_url: String,
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub referral_expiry: Duration,
    pub probe_timeout: Duration,
}

/// Resolved proxy configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub public_address: Option<String>,
    pub public_port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub max_connections: usize,
    pub connection_timeout: Duration,
    pub debug: bool,
    pub auth: AuthSettings,
    pub transfer: TransferSettings,
    pub backends: Vec<BackendConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &CliOverrides::default())
    }
}

impl ProxyConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> ProxyResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| ProxyError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, cli);
        config.validate()?;
        Ok(config)
    }

    fn resolve(file: ConfigFile, cli: &CliOverrides) -> Self {
        let proxy = file.proxy;
        let auth = file.auth;

        let mut backends = file.backends;
        if backends.is_empty() {
            backends.push(BackendConfig::new("lobby", "127.0.0.1", 5520, true));
        }

        let cert = cli.cert.clone().unwrap_or(proxy.cert);
        let key = cli.key.clone().unwrap_or(proxy.key);

        Self {
            bind_address: proxy.bind_address,
            bind_port: cli.port.unwrap_or(proxy.bind_port),
            public_address: cli
                .public_address
                .clone()
                .or(proxy.public_address)
                .filter(|a| !a.trim().is_empty()),
            public_port: proxy.public_port,
            cert_path: expand_tilde_str(&cert),
            key_path: expand_tilde_str(&key),
            max_connections: proxy.max_connections,
            connection_timeout: Duration::from_secs(proxy.connection_timeout_secs),
            debug: proxy.debug,
            auth: AuthSettings {
                credentials_path: expand_tilde_str(&auth.credentials_path),
                retry_attempts: auth.retry_attempts.max(1),
                retry_base_delay: Duration::from_millis(auth.retry_base_delay_ms),
                refresh_margin: Duration::from_secs(auth.refresh_margin_secs),
                session_service_url: auth.session_service_url,
                oauth_token_url: auth.oauth_token_url,
                oauth_device_url: auth.oauth_device_url,
                account_data_url: auth.account_data_url,
            },
            transfer: TransferSettings {
                referral_expiry: Duration::from_secs(file.transfer.referral_expiry_secs),
                probe_timeout: Duration::from_millis(file.transfer.probe_timeout_ms),
            },
            backends,
        }
    }

    fn validate(&self) -> ProxyResult<()> {
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.name.trim().is_empty() {
                return Err(ProxyError::Config(format!("backend #{i} has an empty name")));
            }
            let duplicate = self.backends[..i]
                .iter()
                .any(|b| b.name.eq_ignore_ascii_case(&backend.name));
            if duplicate {
                return Err(ProxyError::Config(format!(
                    "duplicate backend name: {}",
                    backend.name
                )));
            }
        }
        if self.backends.iter().filter(|b| b.default).count() > 1 {
            warn!("more than one backend marked default, using the first");
        }
        Ok(())
    }

    /// Address the QUIC listener binds to.
    pub fn bind_socket_addr(&self) -> ProxyResult<SocketAddr> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid bind address {}: {e}", self.bind_address)))?;
        Ok(SocketAddr::new(ip, self.bind_port))
    }

    /// Case-insensitive backend lookup.
    pub fn backend_by_name(&self, name: &str) -> Option<&BackendConfig> {
        self.backends
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
    }

    /// The backend marked `default = true`, else the first one.
    pub fn default_backend(&self) -> Option<&BackendConfig> {
        self.backends
            .iter()
            .find(|b| b.default)
            .or_else(|| self.backends.first())
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

//! hyproxy: packet-aware reverse proxy for game clients.
//!
//! Terminates client QUIC connections, authenticates players against the
//! identity service, and relays them to configured backend servers.

mod auth;
mod backend;
mod commands;
mod config;
mod context;
mod error;
mod health;
mod server;
mod session;
mod stats;
mod transfer;
mod transport;

use auth::{
    certificate_fingerprint, http_client, CredentialRelay, CredentialStore, GameSessionManager,
    HttpSessionService, RetryPolicy,
};
use backend::{BackendConnector, QuicBackendConnector};
use clap::Parser;
use config::{CliOverrides, ProxyConfig};
use context::ProxyContext;
use health::BackendHealthCache;
use hyproxy_core::{EventDispatcher, InterceptionPipeline, LocalMessaging, MappingRegistry, PacketRegistry, Scheduler};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use server::ProxyServer;
use stats::StatsRegistry;
use session::SessionManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use transfer::ReferralManager;
use tracing::{error, info, warn};

/// How long backend links may sit idle before QUIC drops them.
const BACKEND_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const STATS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// hyproxy: game proxy
#[derive(Parser, Debug)]
#[command(name = "hyproxy", version, about = "Packet-aware reverse proxy for game servers")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.hyproxy/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Address advertised to clients in transfer referrals
    #[arg(long)]
    public_address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting hyproxy");

    let (cert, key) = if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (Some(c.display().to_string()), Some(k.display().to_string()))
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let overrides = CliOverrides {
        port: cli.port,
        cert,
        key,
        public_address: cli.public_address.clone(),
    };
    let config = match ProxyConfig::load(Some(Path::new(&cli.config)), &overrides) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let (certs, private_key) = match load_pem(&config.cert_path, &config.key_path) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to load TLS certificate");
            std::process::exit(1);
        }
    };
    let fingerprint = certs.first().map(|c| certificate_fingerprint(c.as_ref()));
    info!(fingerprint = fingerprint.as_deref().unwrap_or("-"), "proxy certificate loaded");

    let tls = match transport::quic::server_tls_config(certs.clone(), private_key.clone_key()) {
        Ok(tls) => Arc::new(tls),
        Err(e) => {
            error!(error = %e, "failed to build TLS config");
            std::process::exit(1);
        }
    };
    let endpoint = match transport::quic::client_endpoint(certs, private_key, BACKEND_IDLE_TIMEOUT) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(error = %e, "failed to create backend endpoint");
            std::process::exit(1);
        }
    };

    let scheduler = Scheduler::new();
    let stats = StatsRegistry::new();
    stats.install();
    stats.spawn_reporter(&scheduler, STATS_INTERVAL);
    let http = http_client();
    let store = Arc::new(CredentialStore::load(&config.auth.credentials_path));
    let game_session = Arc::new(GameSessionManager::new(http.clone(), store, &config.auth));
    let login = game_session
        .login(|code| {
            println!();
            println!("  Authorize this proxy at {}", code.verification_uri);
            println!("  and enter the code: {}", code.user_code);
            println!();
        })
        .await;
    match login {
        Ok(_) => {
            game_session.spawn_refresh_loop(&scheduler);
        }
        Err(e) => {
            warn!(error = %e, "proxy is not authenticated, players will be refused");
        }
    }

    let service = Arc::new(HttpSessionService::new(
        http,
        config.auth.session_service_url.clone(),
        game_session,
    ));
    let relay = CredentialRelay::new(
        service,
        RetryPolicy::new(config.auth.retry_attempts, config.auth.retry_base_delay),
        fingerprint,
    );

    let registry = Arc::new(PacketRegistry::standard());
    let connector: Arc<dyn BackendConnector> =
        Arc::new(QuicBackendConnector::new(endpoint.clone(), registry.clone()));
    let health = Arc::new(BackendHealthCache::new(connector.clone(), config.transfer.probe_timeout));
    let ctx = Arc::new(ProxyContext {
        pipeline: InterceptionPipeline::new(
            Arc::new(MappingRegistry::with_defaults()),
            EventDispatcher::new(),
        ),
        sessions: Arc::new(SessionManager::new(config.max_connections)),
        messaging: Arc::new(LocalMessaging::new(format!("hyproxy-{}", std::process::id()))),
        relay,
        connector,
        health,
        referrals: ReferralManager::with_cleanup(config.transfer.referral_expiry, &scheduler),
        scheduler,
        registry,
        config,
    });

    commands::register(&ctx);
    let server = ProxyServer::new(ctx.clone(), tls);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                ctx.shutdown("Proxy error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    ctx.shutdown("Proxy shutting down");
    endpoint.close(0u32.into(), b"proxy shutting down");
    endpoint.wait_idle().await;
    info!("hyproxy stopped");
}

/// Read a PEM certificate chain and private key.
fn load_pem(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(format!("no certificate found in {}", cert_path.display()).into());
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;
    Ok((certs, key))
}

/// Generate a self-signed certificate for development use.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".hyproxy");
    std::fs::create_dir_all(&dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "hyproxy dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

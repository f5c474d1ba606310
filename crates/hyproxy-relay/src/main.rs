//! hyproxy-relay: forwards raw game traffic to one backend.
//!
//! The relay never terminates TLS, so the backend still sees the client's
//! own certificate. Use the `hyproxy` binary when packets must be inspected.

mod error;
mod relay;

use clap::Parser;
use error::{RelayError, RelayResult};
use relay::{RelayConfig, UdpRelay};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// hyproxy-relay: layer 4 UDP relay
#[derive(Parser, Debug)]
#[command(name = "hyproxy-relay", version, about = "Raw UDP relay for game traffic")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind_host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 45585)]
    bind_port: u16,

    /// Backend server host
    #[arg(long)]
    backend_host: String,

    /// Backend server port
    #[arg(long, default_value_t = 5520)]
    backend_port: u16,

    /// Seconds of silence before a client flow is dropped
    #[arg(long, default_value_t = 60)]
    idle_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    async fn relay_config(&self) -> RelayResult<RelayConfig> {
        Ok(RelayConfig {
            bind: resolve(&self.bind_host, self.bind_port).await?,
            backend: resolve(&self.backend_host, self.backend_port).await?,
            idle_timeout: Duration::from_secs(self.idle_timeout.max(1)),
        })
    }
}

async fn resolve(host: &str, port: u16) -> RelayResult<SocketAddr> {
    let target = format!("{host}:{port}");
    let first = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|_| RelayError::Resolve(target.clone()))?
        .next();
    first.ok_or(RelayError::Resolve(target))
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

    info!(version = env!("CARGO_PKG_VERSION"), "starting hyproxy-relay");

    let config = match cli.relay_config().await {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid relay address");
            std::process::exit(1);
        }
    };
    let relay = match UdpRelay::bind(config).await {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };

    let runner = relay.clone();
    let mut task = tokio::spawn(async move { runner.run().await });
    tokio::select! {
        result = &mut task => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "relay error");
                std::process::exit(1);
            }
            return;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    relay.shutdown();
    let _ = task.await;
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

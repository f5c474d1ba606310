//! Upstream connections to backend game servers.

use crate::config::BackendConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::session::{BackendLink, ProxySession, SessionInput};
use crate::transport::quic::{spawn_reader, spawn_writer};
use crate::transport::StreamEvent;
use hyproxy_core::PacketRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = ProxyResult<Arc<BackendLink>>> + Send + 'a>>;
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Opens links to backends on behalf of sessions.
pub trait BackendConnector: Send + Sync {
    /// Connect to `backend`. Packets it sends arrive in `session`'s driver
    /// tagged with the returned link's id.
    fn connect<'a>(
        &'a self,
        session: &'a Arc<ProxySession>,
        backend: &'a BackendConfig,
    ) -> ConnectFuture<'a>;

    /// Whether `backend` accepts connections within `timeout`.
    fn probe<'a>(&'a self, backend: &'a BackendConfig, timeout: Duration) -> ProbeFuture<'a>;
}

async fn resolve(backend: &BackendConfig) -> ProxyResult<SocketAddr> {
    let address = backend.address();
    let first = tokio::net::lookup_host(address.as_str())
        .await
        .map_err(|e| ProxyError::Transport(format!("cannot resolve {address}: {e}")))?
        .next();
    first.ok_or_else(|| ProxyError::Transport(format!("no addresses for {address}")))
}

/// Dials backends over QUIC from a shared client endpoint.
pub struct QuicBackendConnector {
    endpoint: quinn::Endpoint,
    registry: Arc<PacketRegistry>,
}

impl QuicBackendConnector {
    pub fn new(endpoint: quinn::Endpoint, registry: Arc<PacketRegistry>) -> Self {
        Self { endpoint, registry }
    }

    async fn dial(&self, backend: &BackendConfig) -> ProxyResult<quinn::Connection> {
        let addr = resolve(backend).await?;
        self.endpoint
            .connect(addr, &backend.host)
            .map_err(|e| ProxyError::Transport(format!("connect to {} failed: {e}", backend.name)))?
            .await
            .map_err(|e| ProxyError::Transport(format!("connect to {} failed: {e}", backend.name)))
    }

    async fn open(
        &self,
        session: &Arc<ProxySession>,
        backend: &BackendConfig,
    ) -> ProxyResult<Arc<BackendLink>> {
        let connection = self.dial(backend).await?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| ProxyError::Transport(format!("failed to open stream: {e}")))?;

        let id = session.next_link_id();
        let shutdown = session.shutdown_token().child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(BackendLink::new(id, &backend.name, tx, shutdown.clone()));
        let label = format!("session-{}/{}#{id}", session.id(), backend.name);

        let writer = spawn_writer(send, rx, self.registry.clone(), shutdown.clone(), label.clone());
        let inbound = session.inbound();
        spawn_reader(recv, self.registry.clone(), shutdown.clone(), label, move |event| {
            match event {
                StreamEvent::Packet(packet) => inbound.send(SessionInput::Backend { link: id, packet }).is_ok(),
                StreamEvent::Closed(reason) => {
                    let _ = inbound.send(SessionInput::BackendClosed { link: id, reason });
                    false
                }
            }
        });

        let name = backend.name.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = connection.closed() => shutdown.cancel(),
            }
            let _ = writer.await;
            connection.close(0u32.into(), b"proxy link closed");
            debug!(backend = %name, link = id, "backend connection closed");
        });

        info!(
            session = session.id(),
            backend = %backend.name,
            addr = %backend.address(),
            link = id,
            "backend connected"
        );
        Ok(link)
    }
}

impl BackendConnector for QuicBackendConnector {
    fn connect<'a>(
        &'a self,
        session: &'a Arc<ProxySession>,
        backend: &'a BackendConfig,
    ) -> ConnectFuture<'a> {
        Box::pin(self.open(session, backend))
    }

    fn probe<'a>(&'a self, backend: &'a BackendConfig, timeout: Duration) -> ProbeFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.dial(backend)).await {
                Ok(Ok(connection)) => {
                    connection.close(0u32.into(), b"probe");
                    true
                }
                Ok(Err(e)) => {
                    debug!(backend = %backend.name, error = %e, "probe failed");
                    false
                }
                Err(_) => {
                    debug!(backend = %backend.name, "probe timed out");
                    false
                }
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing;
    use crate::transport::quic::{client_endpoint, server_tls_config, start_listener};
    use hyproxy_core::packets::ChatMessage;
    use hyproxy_core::{FrameDecoder, Packet};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        (vec![certified.cert.der().clone()], key.into())
    }

    fn chat(text: &str) -> Packet {
        ChatMessage {
            message: Some(text.into()),
        }
        .into()
    }

    #[tokio::test]
    async fn test_quic_link_round_trip() {
        let registry = Arc::new(PacketRegistry::standard());
        let (certs, key) = self_signed();
        let tls = server_tls_config(certs.clone(), key.clone_key()).unwrap();
        let (server, mut incoming) = start_listener(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(tls),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        let port = server.local_addr().unwrap().port();

        let endpoint = client_endpoint(certs, key, Duration::from_secs(10)).unwrap();
        let connector = QuicBackendConnector::new(endpoint, registry.clone());
        let backend = BackendConfig::new("lobby", "127.0.0.1", port, true);
        let mut t = testing::session(1);

        let link = connector.connect(&t.session, &backend).await.unwrap();
        link.send(chat("to backend")).unwrap();

        let accepted = incoming.recv().await.unwrap();
        let (mut send, mut recv) = accepted.connection.accept_bi().await.unwrap();
        let mut decoder = FrameDecoder::new(registry.clone());
        let mut buf = [0u8; 1024];
        let received = loop {
            let n = recv.read(&mut buf).await.unwrap().unwrap();
            decoder.feed(&buf[..n]).unwrap();
            if let Some(packet) = decoder.next_packet().unwrap() {
                break packet;
            }
        };
        assert_eq!(received, chat("to backend"));

        let frame = hyproxy_core::framer::encode(&registry, &chat("to client")).unwrap();
        send.write_all(&frame).await.unwrap();
        match t.inbound_rx.recv().await.unwrap() {
            SessionInput::Backend { link: id, packet } => {
                assert_eq!(id, link.id());
                assert_eq!(packet, chat("to client"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(connector.probe(&backend, Duration::from_secs(5)).await);
        link.close();
        server.close(0u32.into(), b"done");
    }

    #[tokio::test]
    async fn probe_unresolvable_backend() {
        let (certs, key) = self_signed();
        let endpoint = client_endpoint(certs, key, Duration::from_secs(10)).unwrap();
        let connector =
            QuicBackendConnector::new(endpoint, Arc::new(PacketRegistry::standard()));
        let backend = BackendConfig::new("ghost", "host.invalid", 5520, false);
        assert!(!connector.probe(&backend, Duration::from_millis(500)).await);
    }
}

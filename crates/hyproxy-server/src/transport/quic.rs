//! QUIC endpoints and the framed packet pumps that run on their streams.
//!
//! Clients connect to the proxy's server endpoint and may present a
//! certificate, whose fingerprint is later bound into their auth grant.
//! Backends are reached through a client endpoint that presents the
//! proxy's own certificate. Each connection carries one bidirectional
//! stream of length-prefixed packets.

use crate::auth::certificate_fingerprint;
use crate::error::{ProxyError, ProxyResult};
use bytes::BytesMut;
use hyproxy_core::{framer, FrameDecoder, Packet, PacketRegistry};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// ALPN protocol spoken by game clients and servers.
pub const ALPN: &[u8] = b"hytale/1";

const READ_BUF: usize = 16 * 1024;
const KEEP_ALIVE: Duration = Duration::from_secs(5);

/// An accepted QUIC connection.
pub struct IncomingClient {
    pub connection: quinn::Connection,
    pub remote_addr: SocketAddr,
    /// Fingerprint of the client certificate, if one was presented.
    pub fingerprint: Option<String>,
}

fn signature_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

/// Requests a client certificate but accepts any, or none. The certificate
/// only serves as a key the identity service binds grants to.
#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Backends run with self-signed certificates, so the server certificate
/// is not checked against any root.
#[derive(Debug)]
struct SkipServerVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn transport_config(idle_timeout: Duration) -> ProxyResult<Arc<quinn::TransportConfig>> {
    let idle = quinn::IdleTimeout::try_from(idle_timeout)
        .map_err(|e| ProxyError::Config(format!("idle timeout out of range: {e}")))?;
    let mut transport = quinn::TransportConfig::default();
    transport
        .max_idle_timeout(Some(idle))
        .keep_alive_interval(Some(KEEP_ALIVE));
    Ok(Arc::new(transport))
}

/// TLS config for the client-facing endpoint.
pub fn server_tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> ProxyResult<rustls::ServerConfig> {
    let verifier = Arc::new(AcceptAnyClientCert {
        algorithms: signature_algorithms(),
    });
    let mut tls = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("invalid certificate or key: {e}")))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];
    Ok(tls)
}

/// Start the client-facing listener.
///
/// Returns a receiver that yields accepted connections. The listener runs
/// in a background task until the endpoint is closed.
pub async fn start_listener(
    bind_addr: SocketAddr,
    tls_config: Arc<rustls::ServerConfig>,
    idle_timeout: Duration,
) -> ProxyResult<(quinn::Endpoint, mpsc::Receiver<IncomingClient>)> {
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(|e| ProxyError::Transport(format!("QUIC crypto config failed: {e}")))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(transport_config(idle_timeout)?);

    let endpoint = quinn::Endpoint::server(server_config, bind_addr)
        .map_err(|e| ProxyError::Transport(format!("QUIC bind failed: {e}")))?;

    info!(addr = %endpoint.local_addr().unwrap_or(bind_addr), "QUIC listener started");

    let (tx, rx) = mpsc::channel::<IncomingClient>(64);
    let ep = endpoint.clone();

    tokio::spawn(async move {
        while let Some(incoming) = ep.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        let remote_addr = connection.remote_address();
                        let fingerprint = peer_fingerprint(&connection);
                        debug!(
                            remote = %remote_addr,
                            client_cert = fingerprint.is_some(),
                            "QUIC connection accepted"
                        );
                        let client = IncomingClient {
                            connection,
                            remote_addr,
                            fingerprint,
                        };
                        if tx.send(client).await.is_err() {
                            warn!("connection channel closed");
                        }
                    }
                    Err(e) => warn!(error = %e, "QUIC handshake failed"),
                }
            });
        }
        info!("QUIC endpoint closed, stopping listener");
    });

    Ok((endpoint, rx))
}

/// Endpoint used to dial backends, presenting the proxy's certificate.
pub fn client_endpoint(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    idle_timeout: Duration,
) -> ProxyResult<quinn::Endpoint> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification {
            algorithms: signature_algorithms(),
        }))
        .with_client_auth_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("invalid client certificate: {e}")))?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| ProxyError::Transport(format!("TLS config error: {e}")))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic));
    client_config.transport_config(transport_config(idle_timeout)?);

    let mut endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
        .map_err(|e| ProxyError::Transport(format!("endpoint error: {e}")))?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Fingerprint of the certificate the peer presented, if any.
pub fn peer_fingerprint(connection: &quinn::Connection) -> Option<String> {
    let identity = connection.peer_identity()?;
    let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
    certs.first().map(|cert| certificate_fingerprint(cert.as_ref()))
}

/// What a reader task reports.
#[derive(Debug)]
pub enum StreamEvent {
    Packet(Packet),
    /// The stream ended. `Some` carries the failure that ended it.
    Closed(Option<String>),
}

/// Decode packets from `reader` and hand them to `sink` in order.
///
/// The task stops when `sink` returns `false`, the stream ends, framing
/// fails or `shutdown` fires. `sink` always sees a final `Closed` unless
/// it stopped the task itself or shutdown fired first.
pub fn spawn_reader<R, F>(
    mut reader: R,
    registry: Arc<PacketRegistry>,
    shutdown: CancellationToken,
    label: String,
    mut sink: F,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(StreamEvent) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new(registry);
        let mut buf = vec![0u8; READ_BUF];
        let reason = loop {
            let n = tokio::select! {
                _ = shutdown.cancelled() => return,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break None,
                    Ok(n) => n,
                    Err(e) => break Some(format!("read failed: {e}")),
                },
            };
            if let Err(e) = decoder.feed(&buf[..n]) {
                break Some(e.to_string());
            }
            loop {
                match decoder.next_packet() {
                    Ok(Some(packet)) => {
                        trace!(stream = %label, packet = packet.name(), "packet received");
                        if !sink(StreamEvent::Packet(packet)) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(stream = %label, error = %e, "framing error, dropping connection");
                        let _ = sink(StreamEvent::Closed(Some(e.to_string())));
                        return;
                    }
                }
            }
        };
        debug!(stream = %label, reason = reason.as_deref().unwrap_or("eof"), "stream ended");
        let _ = sink(StreamEvent::Closed(reason));
    })
}

/// Encode queued packets onto `writer` until the queue closes or
/// `shutdown` fires. Packets queued before shutdown are still flushed.
pub fn spawn_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    registry: Arc<PacketRegistry>,
    shutdown: CancellationToken,
    label: String,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        loop {
            let packet = tokio::select! {
                biased;
                packet = rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            if !write_packet(&mut writer, &registry, &packet, &mut buf, &label).await {
                return;
            }
        }

        while let Ok(packet) = rx.try_recv() {
            if !write_packet(&mut writer, &registry, &packet, &mut buf, &label).await {
                return;
            }
        }
        let _ = writer.shutdown().await;
        debug!(stream = %label, "writer finished");
    })
}

async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    registry: &PacketRegistry,
    packet: &Packet,
    buf: &mut BytesMut,
    label: &str,
) -> bool {
    buf.clear();
    if let Err(e) = framer::encode_into(registry, packet, buf) {
        warn!(stream = %label, packet = packet.name(), error = %e, "dropping unencodable packet");
        return true;
    }
    match writer.write_all(buf).await {
        Ok(()) => true,
        Err(e) => {
            debug!(stream = %label, error = %e, "write failed");
            false
        }
    }
}

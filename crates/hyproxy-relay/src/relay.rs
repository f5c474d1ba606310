//! Layer 4 UDP relay.
//!
//! Every client address gets its own ephemeral socket connected to the
//! backend, so the backend sees one stable peer per client and replies can
//! be routed back without inspecting the (encrypted) payload. Flows that
//! stay silent longer than the idle timeout are closed by a reaper task.

use crate::error::{RelayError, RelayResult};
use dashmap::DashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 65_535;

/// Reaper never ticks faster than this.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub backend: SocketAddr,
    pub idle_timeout: Duration,
}

/// One client's path to the backend.
struct Flow {
    socket: Arc<UdpSocket>,
    last_seen: Mutex<Instant>,
    cancel: CancellationToken,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl Flow {
    fn touch(&self) {
        if let Ok(mut last) = self.last_seen.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    backend: SocketAddr,
    idle_timeout: Duration,
    flows: Arc<DashMap<SocketAddr, Arc<Flow>>>,
    shutdown: CancellationToken,
}

impl UdpRelay {
    pub async fn bind(config: RelayConfig) -> RelayResult<Self> {
        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.bind,
                source,
            })?;
        Ok(Self {
            socket: Arc::new(socket),
            backend: config.backend,
            idle_timeout: config.idle_timeout,
            flows: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Stop [`run`](Self::run) and close every flow.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Forward datagrams until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> RelayResult<()> {
        info!(
            bind = %self.local_addr()?,
            backend = %self.backend,
            "relay started, forwarding encrypted traffic without inspection"
        );
        let reaper = tokio::spawn(reap_idle(
            self.flows.clone(),
            self.idle_timeout,
            self.shutdown.clone(),
        ));

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, client)) => self.forward(client, &buf[..len]).await,
                        // ICMP unreachable from a departed client surfaces here on some platforms.
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                            debug!(error = %e, "ignoring reset on listen socket");
                        }
                        Err(e) => break Err(RelayError::Io(e)),
                    }
                }
            }
        };

        self.shutdown.cancel();
        let _ = reaper.await;
        let closed = self.close_all();
        info!(flows = closed, "relay stopped");
        result
    }

    async fn forward(&self, client: SocketAddr, datagram: &[u8]) {
        let flow = match self.flows.get(&client).map(|f| f.value().clone()) {
            Some(flow) => flow,
            None => match self.open_flow(client).await {
                Ok(flow) => flow,
                Err(e) => {
                    warn!(client = %client, error = %e, "cannot open backend socket");
                    return;
                }
            },
        };
        flow.touch();
        flow.bytes_up.fetch_add(datagram.len() as u64, Ordering::Relaxed);
        if let Err(e) = flow.socket.send(datagram).await {
            debug!(client = %client, error = %e, "send to backend failed");
        }
    }

    async fn open_flow(&self, client: SocketAddr) -> std::io::Result<Arc<Flow>> {
        let local: SocketAddr = if self.backend.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.backend).await?;

        let flow = Arc::new(Flow {
            socket: Arc::new(socket),
            last_seen: Mutex::new(Instant::now()),
            cancel: self.shutdown.child_token(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        });
        self.flows.insert(client, flow.clone());
        info!(client = %client, backend = %self.backend, "new flow");

        tokio::spawn(pump_replies(
            self.socket.clone(),
            client,
            flow.clone(),
            self.flows.clone(),
        ));
        Ok(flow)
    }

    fn close_all(&self) -> usize {
        let count = self.flows.len();
        for entry in self.flows.iter() {
            entry.value().cancel.cancel();
        }
        self.flows.clear();
        count
    }
}

/// Copy backend replies for one flow back to its client.
async fn pump_replies(
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    flow: Arc<Flow>,
    flows: Arc<DashMap<SocketAddr, Arc<Flow>>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = flow.cancel.cancelled() => break,
            received = flow.socket.recv(&mut buf) => {
                let len = match received {
                    Ok(len) => len,
                    Err(e) => {
                        info!(client = %client, error = %e, "backend socket closed");
                        break;
                    }
                };
                flow.touch();
                flow.bytes_down.fetch_add(len as u64, Ordering::Relaxed);
                if let Err(e) = listener.send_to(&buf[..len], client).await {
                    debug!(client = %client, error = %e, "send to client failed");
                }
            }
        }
    }
    flows.remove_if(&client, |_, current| Arc::ptr_eq(current, &flow));
    debug!(
        client = %client,
        up = flow.bytes_up.load(Ordering::Relaxed),
        down = flow.bytes_down.load(Ordering::Relaxed),
        "flow closed"
    );
}

async fn reap_idle(
    flows: Arc<DashMap<SocketAddr, Arc<Flow>>>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval((idle_timeout / 2).max(MIN_REAP_INTERVAL));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                flows.retain(|client, flow| {
                    if flow.idle_for() < idle_timeout {
                        return true;
                    }
                    info!(client = %client, "reaping idle flow");
                    flow.cancel.cancel();
                    false
                });
            }
        }
    }
}

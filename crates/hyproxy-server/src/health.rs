//! Cached backend reachability.
//!
//! Checks are shared: callers asking about the same backend while a check
//! is running wait for that check instead of starting their own. Results
//! are kept for a short while, longer for backends found offline.

use crate::backend::BackendConnector;
use crate::config::BackendConfig;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

pub const ONLINE_TTL: Duration = Duration::from_millis(1000);
pub const OFFLINE_TTL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy)]
struct Status {
    online: bool,
    checked: Instant,
}

pub struct BackendHealthCache {
    connector: Arc<dyn BackendConnector>,
    timeout: Duration,
    online_ttl: Duration,
    offline_ttl: Duration,
    statuses: DashMap<String, Status>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

fn key(backend: &str) -> String {
    backend.to_ascii_lowercase()
}

impl BackendHealthCache {
    /// `timeout` bounds each reachability check.
    pub fn new(connector: Arc<dyn BackendConnector>, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            online_ttl: ONLINE_TTL,
            offline_ttl: OFFLINE_TTL,
            statuses: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// The last result for `backend` if it has not expired.
    pub fn cached(&self, backend: &str) -> Option<bool> {
        let status = *self.statuses.get(&key(backend))?;
        let ttl = if status.online {
            self.online_ttl
        } else {
            self.offline_ttl
        };
        (status.checked.elapsed() < ttl).then_some(status.online)
    }

    /// Whether `backend` accepts connections, from cache when fresh.
    pub async fn is_online(&self, backend: &BackendConfig) -> bool {
        if let Some(online) = self.cached(&backend.name) {
            return online;
        }
        let gate = self
            .in_flight
            .entry(key(&backend.name))
            .or_default()
            .clone();
        let _running = gate.lock().await;
        if let Some(online) = self.cached(&backend.name) {
            return online;
        }

        let online = self.connector.probe(backend, self.timeout).await;
        debug!(backend = %backend.name, online, "backend health checked");
        self.record(&backend.name, online);
        online
    }

    /// Store an outcome seen elsewhere, such as a failed connect.
    pub fn record(&self, backend: &str, online: bool) {
        let previous = self.statuses.insert(
            key(backend),
            Status {
                online,
                checked: Instant::now(),
            },
        );
        if previous.is_some_and(|p| p.online != online) {
            info!(backend, online, "backend health changed");
        }
    }

    /// Forget what is known about `backend`.
    pub fn invalidate(&self, backend: &str) {
        self.statuses.remove(&key(backend));
    }
}

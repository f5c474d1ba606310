//! Proxy counters and gauges.
//!
//! Call sites use the `metrics` macros. [`StatsRegistry`] is the recorder
//! the binary installs; it keeps every series in memory and logs them
//! periodically.

use hyproxy_core::{Direction, Scheduler, TaskHandle};
use metrics::{
    counter, gauge, histogram, Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};
use metrics_util::registry::{AtomicStorage, Registry};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub fn connection_accepted() {
    counter!("hyproxy_connections_accepted").increment(1);
}

pub fn connection_rejected(reason: &'static str) {
    counter!("hyproxy_connections_rejected", "reason" => reason).increment(1);
}

pub fn sessions_active(count: usize) {
    gauge!("hyproxy_sessions_active").set(count as f64);
}

pub fn session_closed(state: &'static str) {
    counter!("hyproxy_sessions_closed", "state" => state).increment(1);
}

pub fn packet(direction: Direction) {
    let direction = if direction.is_client_to_server() {
        "client_to_server"
    } else {
        "server_to_client"
    };
    counter!("hyproxy_packets", "direction" => direction).increment(1);
}

pub fn auth_failed(stage: &'static str) {
    counter!("hyproxy_auth_failures", "stage" => stage).increment(1);
}

/// A backend accepted a player, `elapsed` after the dial started when known.
pub fn backend_connected(backend: &str, elapsed: Option<Duration>) {
    counter!("hyproxy_backend_connections", "backend" => backend.to_string()).increment(1);
    if let Some(elapsed) = elapsed {
        histogram!("hyproxy_backend_connect_seconds").record(elapsed.as_secs_f64());
    }
}

pub fn backend_failed(backend: &str) {
    counter!("hyproxy_backend_connect_failures", "backend" => backend.to_string()).increment(1);
}

pub fn transfer_started() {
    counter!("hyproxy_transfers", "outcome" => "initiated").increment(1);
}

pub fn transfer_finished<T, E>(result: &Result<T, E>) {
    let outcome = if result.is_ok() { "completed" } else { "failed" };
    counter!("hyproxy_transfers", "outcome" => outcome).increment(1);
}

fn series_name(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

/// In-memory recorder holding every series reported in this process.
#[derive(Clone)]
pub struct StatsRegistry {
    inner: Arc<Registry<Key, AtomicStorage>>,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Registry::atomic()),
        }
    }

    /// Make this the process-wide recorder.
    pub fn install(&self) {
        if metrics::set_global_recorder(self.clone()).is_err() {
            warn!("metrics recorder already installed");
        }
    }

    /// Every counter and gauge as `(series, value)`, sorted by series.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut series = Vec::new();
        self.inner.visit_counters(|key, value| {
            series.push((series_name(key), value.load(Ordering::Relaxed) as f64));
        });
        self.inner.visit_gauges(|key, value| {
            series.push((series_name(key), f64::from_bits(value.load(Ordering::Relaxed))));
        });
        series.sort_by(|a, b| a.0.cmp(&b.0));
        series
    }

    /// Log the snapshot every `period`.
    pub fn spawn_reporter(&self, scheduler: &Scheduler, period: Duration) -> TaskHandle {
        let registry = self.clone();
        scheduler.run_repeating("stats", period, period, move || {
            let series = registry.snapshot();
            async move {
                for (name, value) in series {
                    info!(series = %name, value, "stats");
                }
            }
        })
    }
}

impl Recorder for StatsRegistry {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.inner.get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.inner.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.inner.get_or_create_histogram(key, |h| h.clone().into())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::StatsRegistry;
    use std::sync::atomic::Ordering;

    impl StatsRegistry {
        /// Sum of counter `name` over the series carrying every label in `labels`.
        pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
            let mut total = 0;
            self.inner.visit_counters(|key, value| {
                let matches = key.name() == name
                    && labels
                        .iter()
                        .all(|(k, v)| key.labels().any(|l| l.key() == *k && l.value() == *v));
                if matches {
                    total += value.load(Ordering::Relaxed);
                }
            });
            total
        }

        pub fn gauge(&self, name: &str) -> Option<f64> {
            let mut found = None;
            self.inner.visit_gauges(|key, value| {
                if key.name() == name {
                    found = Some(f64::from_bits(value.load(Ordering::Relaxed)));
                }
            });
            found
        }
    }

    /// Run `f` with a private recorder and return what it recorded.
    pub(crate) fn record(f: impl FnOnce()) -> StatsRegistry {
        let registry = StatsRegistry::new();
        metrics::with_local_recorder(&registry, f);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::testing::record;
    use super::*;
    use crate::session::SessionManager;

    #[test]
    fn test_labelled_counters() {
        let recorded = record(|| {
            connection_accepted();
            connection_accepted();
            connection_rejected("full");
            packet(Direction::ClientToServer);
            packet(Direction::ServerToClient);
            packet(Direction::ServerToClient);
            backend_failed("lobby");
        });
        assert_eq!(recorded.counter("hyproxy_connections_accepted", &[]), 2);
        assert_eq!(recorded.counter("hyproxy_connections_rejected", &[("reason", "full")]), 1);
        assert_eq!(recorded.counter("hyproxy_packets", &[("direction", "server_to_client")]), 2);
        assert_eq!(recorded.counter("hyproxy_packets", &[]), 3);
        assert_eq!(
            recorded.counter("hyproxy_backend_connect_failures", &[("backend", "lobby")]),
            1
        );
        assert_eq!(
            recorded.counter("hyproxy_backend_connect_failures", &[("backend", "survival")]),
            0
        );
    }

    #[test]
    fn transfer_outcomes() {
        let recorded = record(|| {
            transfer_started();
            transfer_started();
            transfer_finished::<(), ()>(&Ok(()));
            transfer_finished::<(), &str>(&Err("unreachable"));
        });
        assert_eq!(recorded.counter("hyproxy_transfers", &[("outcome", "initiated")]), 2);
        assert_eq!(recorded.counter("hyproxy_transfers", &[("outcome", "completed")]), 1);
        assert_eq!(recorded.counter("hyproxy_transfers", &[("outcome", "failed")]), 1);
    }

    #[test]
    fn session_gauge_follows_registry() {
        let recorded = record(|| {
            let manager = SessionManager::new(10);
            let a = crate::session::testing::session(manager.next_session_id());
            let b = crate::session::testing::session(manager.next_session_id());
            manager.register(a.session.clone()).unwrap();
            manager.register(b.session.clone()).unwrap();
            manager.remove(a.session.id());
        });
        assert_eq!(recorded.gauge("hyproxy_sessions_active"), Some(1.0));
    }

    #[test]
    fn snapshot_names_series_with_labels() {
        let recorded = record(|| {
            connection_rejected("full");
            sessions_active(4);
        });
        assert_eq!(
            recorded.snapshot(),
            vec![
                ("hyproxy_connections_rejected{reason=full}".to_string(), 1.0),
                ("hyproxy_sessions_active".to_string(), 4.0),
            ]
        );
    }
}

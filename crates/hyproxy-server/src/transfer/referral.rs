//! Pending referrals: which backend a player is expected to land on when
//! they reconnect after a `ClientReferral`.

use dashmap::DashMap;
use hyproxy_core::{Scheduler, TaskHandle};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of referral payloads minted by this proxy.
pub const REFERRAL_PREFIX: &str = "HYPROXY:";

const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
const CLEANUP_OWNER: &str = "referrals";

/// Referral payload naming `backend`.
pub fn referral_data(backend: &str) -> Vec<u8> {
    format!("{REFERRAL_PREFIX}{backend}").into_bytes()
}

/// Backend named by a payload minted by [`referral_data`].
pub fn parse_referral_data(data: &[u8]) -> Option<&str> {
    std::str::from_utf8(data).ok()?.strip_prefix(REFERRAL_PREFIX)
}

#[derive(Debug)]
struct PendingReferral {
    backend: String,
    created: Instant,
}

pub struct ReferralManager {
    pending: DashMap<Uuid, PendingReferral>,
    expiry: Duration,
    cleanup: Mutex<Option<TaskHandle>>,
}

impl ReferralManager {
    pub fn new(expiry: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            expiry,
            cleanup: Mutex::new(None),
        }
    }

    /// Create a manager whose expired entries are swept periodically.
    pub fn with_cleanup(expiry: Duration, scheduler: &Scheduler) -> Arc<Self> {
        let manager = Arc::new(Self::new(expiry));
        let weak: Weak<Self> = Arc::downgrade(&manager);
        let handle = scheduler.run_repeating(CLEANUP_OWNER, CLEANUP_INTERVAL, CLEANUP_INTERVAL, move || {
            let weak = weak.clone();
            async move {
                if let Some(manager) = weak.upgrade() {
                    manager.cleanup_expired();
                }
            }
        });
        *manager.cleanup.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        manager
    }

    /// Record that `uuid` is being sent to `backend`. Returns the payload
    /// the client has to present when it reconnects.
    pub fn create(&self, uuid: Uuid, backend: &str) -> Vec<u8> {
        self.pending.insert(
            uuid,
            PendingReferral {
                backend: backend.to_string(),
                created: Instant::now(),
            },
        );
        info!(%uuid, backend, "referral created");
        referral_data(backend)
    }

    /// Take the pending referral for `uuid`. The stored target wins over
    /// whatever the client's payload claims.
    pub fn consume(&self, uuid: Uuid, data: Option<&[u8]>) -> Option<String> {
        let (_, pending) = self.pending.remove(&uuid)?;
        if pending.created.elapsed() > self.expiry {
            warn!(%uuid, backend = %pending.backend, "referral expired");
            return None;
        }
        if let Some(claimed) = data.filter(|d| !d.is_empty()).and_then(parse_referral_data) {
            if claimed != pending.backend {
                warn!(%uuid, expected = %pending.backend, got = claimed, "referral data mismatch");
            }
        }
        info!(%uuid, backend = %pending.backend, "referral consumed");
        Some(pending.backend)
    }

    pub fn has_pending(&self, uuid: Uuid) -> bool {
        self.pending
            .get(&uuid)
            .is_some_and(|p| p.created.elapsed() <= self.expiry)
    }

    pub fn cancel(&self, uuid: Uuid) -> bool {
        let removed = self.pending.remove(&uuid).is_some();
        if removed {
            debug!(%uuid, "referral cancelled");
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop expired referrals. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|uuid, p| {
            let keep = p.created.elapsed() <= self.expiry;
            if !keep {
                debug!(%uuid, "referral expired");
            }
            keep
        });
        before.saturating_sub(self.pending.len())
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.cleanup.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.cancel();
        }
        self.pending.clear();
    }
}

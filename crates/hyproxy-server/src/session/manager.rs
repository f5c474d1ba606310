//! Registry of live sessions.
//!
//! Sessions are indexed by id from the moment the connection is accepted,
//! and by player uuid once the handshake has identified the player.

use super::ProxySession;
use crate::error::{ProxyError, ProxyResult};
use crate::stats;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SessionManager {
    sessions: DashMap<u64, Arc<ProxySession>>,
    by_uuid: DashMap<Uuid, u64>,
    next_id: AtomicU64,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            by_uuid: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_sessions,
        }
    }

    /// Allocate an id for a new session.
    pub fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether another connection can be accepted.
    pub fn has_capacity(&self) -> bool {
        self.sessions.len() < self.max_sessions
    }

    pub fn register(&self, session: Arc<ProxySession>) -> ProxyResult<()> {
        if !self.has_capacity() {
            return Err(ProxyError::Other(format!(
                "max connections ({}) reached",
                self.max_sessions
            )));
        }
        debug!(session = session.id(), remote = %session.remote_addr(), "session registered");
        self.sessions.insert(session.id(), session);
        stats::sessions_active(self.sessions.len());
        Ok(())
    }

    /// Index `session` by its player's uuid. Returns the session previously
    /// holding that uuid, which the caller is expected to disconnect.
    pub fn register_player(&self, session: &Arc<ProxySession>) -> Option<Arc<ProxySession>> {
        let uuid = session.identity().uuid?;
        let previous = self.by_uuid.insert(uuid, session.id())?;
        if previous == session.id() {
            return None;
        }
        info!(%uuid, old = previous, new = session.id(), "player logged in again, replacing session");
        self.get(previous)
    }

    pub fn get(&self, id: u64) -> Option<Arc<ProxySession>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn by_uuid(&self, uuid: Uuid) -> Option<Arc<ProxySession>> {
        let id = *self.by_uuid.get(&uuid)?;
        self.get(id)
    }

    /// Case-insensitive username lookup.
    pub fn by_name(&self, name: &str) -> Option<Arc<ProxySession>> {
        self.sessions
            .iter()
            .find(|entry| {
                entry
                    .value()
                    .identity()
                    .username
                    .is_some_and(|u| u.eq_ignore_ascii_case(name))
            })
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: u64) -> Option<Arc<ProxySession>> {
        let (_, session) = self.sessions.remove(&id)?;
        if let Some(uuid) = session.identity().uuid {
            self.by_uuid.remove_if(&uuid, |_, owner| *owner == id);
        }
        debug!(session = id, "session removed");
        stats::sessions_active(self.sessions.len());
        Some(session)
    }

    pub fn all(&self) -> Vec<Arc<ProxySession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Disconnect every session with `reason` and clear the registry.
    pub fn close_all(&self, reason: &str) -> usize {
        let sessions = self.all();
        for session in &sessions {
            session.disconnect(reason);
        }
        self.sessions.clear();
        self.by_uuid.clear();
        stats::sessions_active(0);
        info!(count = sessions.len(), "all sessions closed");
        sessions.len()
    }
}

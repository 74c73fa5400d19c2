//! Authoritative mapping from cluster key to the live tunnel session.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;
use tunnel_core::{ClusterKey, Session};

/// At most one session per key. Every mutation bumps a generation counter
/// so waiters wake on change instead of polling.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ClusterKey, Session>>,
    generation: watch::Sender<u64>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            sessions: RwLock::new(HashMap::new()),
            generation,
        }
    }

    /// Install `session` for `key`, returning the session it replaced. The
    /// caller closes the replaced session.
    pub fn register(&self, key: ClusterKey, session: Session) -> Option<Session> {
        let replaced = self.sessions.write().insert(key, session);
        self.bump();
        replaced
    }

    /// Remove `key` only if it still maps to `session_id`. A session that was
    /// already replaced must not evict its successor.
    pub fn remove(&self, key: &ClusterKey, session_id: u64) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            if sessions.get(key).is_some_and(|s| s.id() == session_id) {
                sessions.remove(key);
                true
            } else {
                false
            }
        };
        if removed {
            self.bump();
        }
        removed
    }

    /// Live session for `key`. A session that is closing but not yet
    /// deregistered is treated as absent.
    pub fn get(&self, key: &ClusterKey) -> Option<Session> {
        self.sessions
            .read()
            .get(key)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    pub fn contains(&self, key: &ClusterKey) -> bool {
        self.get(key).is_some()
    }

    /// Wait up to `timeout` for a live session under `key`.
    pub async fn wait_for(&self, key: &ClusterKey, timeout: Duration) -> Option<Session> {
        let deadline = Instant::now() + timeout;
        let mut changes = self.generation.subscribe();
        loop {
            if let Some(session) = self.get(key) {
                return Some(session);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    pub fn keys(&self) -> Vec<ClusterKey> {
        let mut keys: Vec<ClusterKey> = self.sessions.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Deregister and close every session.
    pub fn close_all(&self) {
        let sessions: Vec<Session> = self.sessions.write().drain().map(|(_, s)| s).collect();
        self.bump();
        for session in sessions {
            session.close();
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}

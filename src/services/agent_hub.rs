//! In-memory liveness index of connected agents.
//!
//! Purely ephemeral: entries are recreated by each Register or Heartbeat,
//! and the online predicate is derived from the last heartbeat instant.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::models::ServerId;

/// Default liveness window.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(90);

/// Tracks which agents are currently connected.
pub struct AgentHub {
    window: chrono::Duration,
    inner: Mutex<HashMap<ServerId, DateTime<Utc>>>,
}

impl AgentHub {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(90)),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record a heartbeat for the server, now.
    pub fn touch(&self, server_id: ServerId) {
        self.touch_at(server_id, Utc::now());
    }

    pub fn touch_at(&self, server_id: ServerId, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("agent hub lock poisoned");
        inner.insert(server_id, at);
    }

    pub fn last_heartbeat(&self, server_id: ServerId) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().expect("agent hub lock poisoned");
        inner.get(&server_id).copied()
    }

    /// A server is online iff its last heartbeat falls inside the window.
    pub fn is_online(&self, server_id: ServerId) -> bool {
        self.last_heartbeat(server_id)
            .is_some_and(|at| Utc::now() - at <= self.window)
    }

    pub fn list(&self) -> Vec<(ServerId, DateTime<Utc>)> {
        let inner = self.inner.lock().expect("agent hub lock poisoned");
        inner.iter().map(|(id, at)| (*id, *at)).collect()
    }

    pub fn remove(&self, server_id: ServerId) {
        let mut inner = self.inner.lock().expect("agent hub lock poisoned");
        inner.remove(&server_id);
    }
}

impl Default for AgentHub {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_server_is_offline() {
        let hub = AgentHub::default();
        assert!(!hub.is_online(ServerId::new()));
    }

    #[test]
    fn test_touch_makes_server_online() {
        let hub = AgentHub::default();
        let server = ServerId::new();
        hub.touch(server);
        assert!(hub.is_online(server));
    }

    #[test]
    fn test_stale_heartbeat_is_offline() {
        let hub = AgentHub::new(Duration::from_secs(90));
        let server = ServerId::new();
        hub.touch_at(server, Utc::now() - chrono::Duration::seconds(120));
        assert!(!hub.is_online(server));
        // The entry itself is still listed; only the predicate flips.
        assert_eq!(hub.list().len(), 1);
    }
}

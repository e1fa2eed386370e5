//! Per-server FIFO of pending control commands.
//!
//! Commands live here until the next heartbeat from the target server
//! drains them. Delivery is at-most-once: drain atomically returns and
//! clears, and there is no acknowledgement.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::domain::models::{AgentCommand, ServerId};

/// Ordered pending commands keyed by server.
#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<HashMap<ServerId, VecDeque<AgentCommand>>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command to the server's queue. FIFO order is preserved.
    pub fn enqueue(&self, server_id: ServerId, command: AgentCommand) {
        let mut inner = self.inner.lock().expect("command queue lock poisoned");
        inner.entry(server_id).or_default().push_back(command);
    }

    /// Atomically take and clear everything pending for the server.
    pub fn drain(&self, server_id: ServerId) -> Vec<AgentCommand> {
        let mut inner = self.inner.lock().expect("command queue lock poisoned");
        inner
            .remove(&server_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Number of commands currently queued for the server.
    pub fn pending(&self, server_id: ServerId) -> usize {
        let inner = self.inner.lock().expect("command queue lock poisoned");
        inner.get(&server_id).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AgentCommandKind;

    #[test]
    fn test_drain_preserves_fifo_order() {
        let queue = CommandQueue::new();
        let server = ServerId::new();
        queue.enqueue(server, AgentCommand::with_payload(AgentCommandKind::UpdateAgent, "first"));
        queue.enqueue(server, AgentCommand::new(AgentCommandKind::Restart));

        let drained = queue.drain(server);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, AgentCommandKind::UpdateAgent);
        assert_eq!(drained[1].kind, AgentCommandKind::Restart);
    }

    #[test]
    fn test_drain_is_at_most_once() {
        let queue = CommandQueue::new();
        let server = ServerId::new();
        queue.enqueue(server, AgentCommand::new(AgentCommandKind::Shutdown));

        assert_eq!(queue.drain(server).len(), 1);
        assert!(queue.drain(server).is_empty());
    }

    #[test]
    fn test_queues_are_isolated_per_server() {
        let queue = CommandQueue::new();
        let a = ServerId::new();
        let b = ServerId::new();
        queue.enqueue(a, AgentCommand::new(AgentCommandKind::Restart));

        assert_eq!(queue.pending(a), 1);
        assert_eq!(queue.pending(b), 0);
        assert!(queue.drain(b).is_empty());
        assert_eq!(queue.pending(a), 1);
    }
}

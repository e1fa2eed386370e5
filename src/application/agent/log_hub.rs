//! Per-deployment log broadcaster on the agent.
//!
//! One acquisition path, two sinks: lines published here fan out to every
//! open StreamDeployLogs subscriber and accumulate in a bounded buffer that
//! becomes the ExecuteDeploy reply body. Subscribing before the deploy
//! starts is supported (the plane opens its stream first) and replays
//! nothing because nothing has happened yet; a late subscriber gets the
//! buffered backlog replayed.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::models::DeploymentId;

const BUFFER_LINE_CAP: usize = 10_000;
const SUBSCRIBER_QUEUE: usize = 256;

struct Entry {
    buffer: Vec<String>,
    subscribers: Vec<mpsc::Sender<String>>,
    done: bool,
}

/// Broadcaster tee'ing each deploy log line to stream subscribers and the
/// buffered reply.
#[derive(Default)]
pub struct DeployLogHub {
    inner: Mutex<HashMap<DeploymentId, Entry>>,
}

impl DeployLogHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish one line for a deployment. Creates the entry if the deploy
    /// beat its own subscribers to it.
    pub fn publish(&self, deployment_id: DeploymentId, line: &str) {
        let mut inner = self.inner.lock().expect("log hub lock poisoned");
        let entry = inner.entry(deployment_id).or_insert_with(|| Entry {
            buffer: Vec::new(),
            subscribers: Vec::new(),
            done: false,
        });
        if entry.buffer.len() < BUFFER_LINE_CAP {
            entry.buffer.push(line.to_string());
        }
        entry.subscribers.retain(|tx| {
            if tx.try_send(line.to_string()).is_err() {
                trace!(deployment_id = %deployment_id, "dropping lagging log subscriber");
                false
            } else {
                true
            }
        });
    }

    /// Subscribe to a deployment's lines. Buffered backlog is replayed
    /// first; the channel closes when the deploy finishes.
    pub fn subscribe(&self, deployment_id: DeploymentId) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.inner.lock().expect("log hub lock poisoned");
        let entry = inner.entry(deployment_id).or_insert_with(|| Entry {
            buffer: Vec::new(),
            subscribers: Vec::new(),
            done: false,
        });
        for line in &entry.buffer {
            if tx.try_send(line.clone()).is_err() {
                break;
            }
        }
        if !entry.done {
            entry.subscribers.push(tx);
        }
        rx
    }

    /// Mark a deployment finished, close its subscribers and return the
    /// buffered text for the reply body.
    pub fn finish(&self, deployment_id: DeploymentId) -> String {
        let mut inner = self.inner.lock().expect("log hub lock poisoned");
        match inner.remove(&deployment_id) {
            Some(mut entry) => {
                entry.done = true;
                entry.subscribers.clear();
                entry.buffer.join("\n")
            }
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_early_subscriber_sees_all_lines() {
        let hub = DeployLogHub::new();
        let id = DeploymentId::new();
        let mut rx = hub.subscribe(id);

        hub.publish(id, "cloning");
        hub.publish(id, "building");
        assert_eq!(rx.recv().await.unwrap(), "cloning");
        assert_eq!(rx.recv().await.unwrap(), "building");
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_backlog_replayed() {
        let hub = DeployLogHub::new();
        let id = DeploymentId::new();
        hub.publish(id, "one");
        hub.publish(id, "two");

        let mut rx = hub.subscribe(id);
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_finish_returns_buffer_and_closes_streams() {
        let hub = DeployLogHub::new();
        let id = DeploymentId::new();
        let mut rx = hub.subscribe(id);
        hub.publish(id, "a");
        hub.publish(id, "b");

        let body = hub.finish(id);
        assert_eq!(body, "a\nb");

        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap(), "b");
        assert!(rx.recv().await.is_none());
    }
}

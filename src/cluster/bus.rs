//! Cluster message bus handler: pub/sub fan-out over the cluster topic,
//! realized as a `tokio::sync::broadcast` channel so every subscribed node
//! gets its own receiver.

use tokio::sync::broadcast;
use tracing::debug;

use super::state::{FileStatus, OplockKind};

/// One event published on the shared cluster topic.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    StateAdded { path: String, sender_node: String },
    StateUpdated { path: String, sender_node: String },
    StateRemoved { path: String, sender_node: String },
    StateEvicted { path: String, sender_node: String },
    OplockBreakRequest { path: String, to_kind: Option<OplockKind>, holder_node: String, sender_node: String },
    OplockReleased { path: String, sender_node: String },
    DataUpdateStarted { path: String, node_id: String, sender_node: String },
    DataUpdateEnded { path: String, node_id: String, sender_node: String },
}

impl ClusterEvent {
    fn sender_node(&self) -> &str {
        match self {
            ClusterEvent::StateAdded { sender_node, .. }
            | ClusterEvent::StateUpdated { sender_node, .. }
            | ClusterEvent::StateRemoved { sender_node, .. }
            | ClusterEvent::StateEvicted { sender_node, .. }
            | ClusterEvent::OplockBreakRequest { sender_node, .. }
            | ClusterEvent::OplockReleased { sender_node, .. }
            | ClusterEvent::DataUpdateStarted { sender_node, .. }
            | ClusterEvent::DataUpdateEnded { sender_node, .. } => sender_node,
        }
    }
}

/// The shared topic: a broadcast sender every node clones a receiver from.
#[derive(Clone)]
pub struct ClusterBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl ClusterBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ClusterEvent) {
        // `send` only errors when there are no receivers; that's a valid
        // steady state (no subscribers yet), not a failure.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }
}

/// Runs one node's subscription loop, ignoring events this node itself
/// published by comparing sender node id. `on_event` must not block; hand
/// heavier work to the runtime.
pub async fn run_subscriber<F>(local_node: String, mut receiver: broadcast::Receiver<ClusterEvent>, mut on_event: F)
where
    F: FnMut(ClusterEvent) + Send,
{
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if event.sender_node() == local_node {
                    continue;
                }
                on_event(event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "cluster bus subscriber lagged, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Reports how a replicated state change should be mirrored locally, used
/// by callers that fold `ClusterEvent` into their own bookkeeping.
pub fn mirrors_status(event: &ClusterEvent) -> Option<(&str, FileStatus)> {
    match event {
        ClusterEvent::StateUpdated { path, .. } => Some((path.as_str(), FileStatus::FileExists)),
        ClusterEvent::StateRemoved { path, .. } | ClusterEvent::StateEvicted { path, .. } => {
            Some((path.as_str(), FileStatus::NotExist))
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn subscriber_ignores_its_own_echoes() {
        let bus = ClusterBus::new(16);
        let mut receiver = bus.subscribe();
        bus.publish(ClusterEvent::StateAdded { path: "/a".into(), sender_node: "node-a".into() });
        bus.publish(ClusterEvent::StateAdded { path: "/b".into(), sender_node: "node-b".into() });

        let first = receiver.recv().await.unwrap();
        assert!(matches!(first, ClusterEvent::StateAdded { sender_node, .. } if sender_node == "node-a"));
        let second = receiver.recv().await.unwrap();
        assert!(matches!(second, ClusterEvent::StateAdded { sender_node, .. } if sender_node == "node-b"));
    }

    #[tokio::test]
    async fn run_subscriber_skips_local_node_events() {
        let bus = ClusterBus::new(16);
        let receiver = bus.subscribe();
        bus.publish(ClusterEvent::StateAdded { path: "/a".into(), sender_node: "node-a".into() });
        bus.publish(ClusterEvent::StateAdded { path: "/b".into(), sender_node: "node-b".into() });
        drop(bus);

        let mut seen = Vec::new();
        run_subscriber("node-a".into(), receiver, |event| {
            if let ClusterEvent::StateAdded { path, .. } = event {
                seen.push(path);
            }
        })
        .await;
        assert_eq!(seen, vec!["/b".to_owned()]);
    }
}

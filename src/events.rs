use crate::models::{OntologyAlert, RelistQueueEntry};
use serde::Serialize;
use tokio::sync::broadcast;

/// Push notifications for the UI layer: queue ticks, reconciliation
/// progress and ontology alerts. Delivered over the `/events` SSE route.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    QueueUpdate {
        queue: Vec<RelistQueueEntry>,
        countdown: i64,
        processing: bool,
    },
    SyncProgress {
        stage: SyncStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        current: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<usize>,
    },
    OntologyAlert { alert: OntologyAlert },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Starting,
    Progress,
    Done,
}

/// Process-wide fan-out bus. Publishing never blocks; events published with
/// no subscriber are dropped, which is fine for a UI feed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BridgeEvent::SyncProgress {
            stage: SyncStage::Starting,
            current: None,
            total: None,
        });
        let event = rx.recv().await.expect("event");
        match event {
            BridgeEvent::SyncProgress { stage, .. } => assert_eq!(stage, SyncStage::Starting),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(BridgeEvent::QueueUpdate {
            queue: vec![],
            countdown: 0,
            processing: false,
        });
    }
}

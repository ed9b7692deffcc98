use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

/// Fire-and-forget events published by the supervisor and the checkpoint
/// manager. Consumers (analytics, tests) subscribe; a slow or dropped
/// subscriber never blocks the publisher.
#[derive(Clone, Debug)]
pub enum ServerEvent {
    SessionTransition {
        session: String,
        state: &'static str,
    },
    SessionOrphaned {
        session: String,
        pid: u32,
    },
    ZombieSuspected {
        session: String,
        pid: u32,
    },
    BinaryResolved {
        path: String,
        version: Option<String>,
    },
    CheckpointCreated {
        id: String,
        files: usize,
        bytes: u64,
    },
    CheckpointRestored {
        id: String,
    },
    GcCompleted {
        objects_removed: u64,
        bytes_freed: u64,
    },
}

/// Multi-subscriber event bus; senders are dropped when their receiver
/// goes away.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<Mutex<Vec<mpsc::UnboundedSender<ServerEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: ServerEvent) {
        debug!(?event, "server event");
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_live_subscribers() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let second = bus.subscribe();
        drop(second);

        bus.publish(ServerEvent::CheckpointRestored { id: "c1".into() });
        bus.publish(ServerEvent::GcCompleted {
            objects_removed: 2,
            bytes_freed: 64,
        });

        assert!(matches!(
            first.recv().await,
            Some(ServerEvent::CheckpointRestored { .. })
        ));
        assert!(matches!(
            first.recv().await,
            Some(ServerEvent::GcCompleted { .. })
        ));
    }
}

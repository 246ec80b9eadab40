//! Pipeline event bus.
//!
//! Stage transitions and queue mutations are announced on a broadcast
//! channel instead of components calling back into each other: the
//! commander subscribes to stage changes, the orchestrator subscribes to
//! the commander's completion events. Lagging subscribers lose old events
//! rather than blocking the sender.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::{ItemId, Stage};

/// Capacity of the queue event channel. Subscribers that fall further
/// behind than this see a `Lagged` error and resynchronise from a snapshot.
pub const QUEUE_EVENT_CAPACITY: usize = 256;

/// An observable change to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A single item's fields changed.
    ItemUpdated { id: ItemId },
    /// An item entered a new stage.
    StageChanged { id: ItemId, stage: Stage },
    /// Structural change: admission, removal, or reorder.
    QueueChanged,
}

/// Create the queue event channel.
pub fn queue_channel() -> broadcast::Sender<QueueEvent> {
    broadcast::channel(QUEUE_EVENT_CAPACITY).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscriber() {
        let tx = queue_channel();
        let mut rx = tx.subscribe();

        tx.send(QueueEvent::QueueChanged).unwrap();
        tx.send(QueueEvent::StageChanged {
            id: ItemId(3),
            stage: Stage::Transcode,
        })
        .unwrap();

        assert_eq!(rx.recv().await.unwrap(), QueueEvent::QueueChanged);
        assert_eq!(
            rx.recv().await.unwrap(),
            QueueEvent::StageChanged {
                id: ItemId(3),
                stage: Stage::Transcode
            }
        );
    }

    #[test]
    fn test_send_without_subscribers_is_harmless() {
        let tx = queue_channel();
        // No receiver; send returns Err but must not panic callers.
        let _ = tx.send(QueueEvent::QueueChanged);
    }
}

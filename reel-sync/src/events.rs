//! Outward event stream for the UI/application layer.
//!
//! Uses a tokio broadcast channel so every subscriber gets an independent
//! receiver. Subscribers that fall more than `capacity` events behind lose
//! the oldest ones (`RecvError::Lagged`); the engine never waits on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::activity::SyncTier;
use crate::presence_file::Collaborator;

/// Which shared-file operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Read,
    Write,
}

/// Kind of remote annotation mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Added,
    Updated,
    Deleted,
    Resolved,
    Cleared,
}

/// Everything the engine reports outward.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    SessionStarted {
        session_id: String,
        document_path: String,
    },
    SessionStopped {
        session_id: String,
    },
    /// The set of sessions in the shared presence file changed.
    CollaboratorsChanged {
        collaborators: Vec<Collaborator>,
    },
    /// Went from alone to at least one other participant.
    CollaborationStarted {
        others: usize,
    },
    /// Back to alone.
    CollaborationEnded,

    PeerConnected {
        peer_id: String,
        name: String,
    },
    PeerDisconnected {
        peer_id: String,
        reason: String,
    },
    PeerReconnecting {
        peer_id: String,
        attempt: u32,
    },
    /// Remote frame/cursor position changed.
    PeerPresenceChanged {
        peer_id: String,
    },

    RemoteComment {
        kind: MutationKind,
        from: String,
        comment_id: String,
    },
    RemoteReply {
        kind: MutationKind,
        from: String,
        parent_id: String,
        reply_id: Option<String>,
    },
    RemoteDrawing {
        kind: MutationKind,
        from: String,
        drawing_id: Option<String>,
    },

    SyncStarted,
    SyncCompleted {
        comments: usize,
        drawings: usize,
    },
    SyncError {
        message: String,
    },
    SyncTierChanged {
        tier: SyncTier,
    },

    LockAcquired {
        target_id: String,
    },
    LockReleased {
        target_id: String,
    },

    /// Shared presence/lock file could not be read or written (after retries).
    SharedFileError {
        op: FileOp,
        message: String,
    },
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStats {
    pub events_emitted: u64,
    /// Emitted while nobody was subscribed.
    pub events_undelivered: u64,
    pub subscribers: usize,
}

struct AtomicEventStats {
    events_emitted: AtomicU64,
    events_undelivered: AtomicU64,
}

/// Subscription registry for [`CollabEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CollabEvent>,
    capacity: usize,
    stats: Arc<AtomicEventStats>,
}

impl EventBus {
    /// `capacity` is the per-subscriber backlog before lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: Arc::new(AtomicEventStats {
                events_emitted: AtomicU64::new(0),
                events_undelivered: AtomicU64::new(0),
            }),
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn emit(&self, event: CollabEvent) -> usize {
        log::trace!("event: {event:?}");
        self.stats.events_emitted.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                self.stats.events_undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            events_emitted: self.stats.events_emitted.load(Ordering::Relaxed),
            events_undelivered: self.stats.events_undelivered.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let delivered = bus.emit(CollabEvent::SyncStarted);
        assert_eq!(delivered, 2);

        assert_eq!(rx1.recv().await.unwrap(), CollabEvent::SyncStarted);
        assert_eq!(rx2.recv().await.unwrap(), CollabEvent::SyncStarted);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(16);
        assert_eq!(bus.emit(CollabEvent::CollaborationEnded), 0);

        let stats = bus.stats();
        assert_eq!(stats.events_emitted, 1);
        assert_eq!(stats.events_undelivered, 1);
        assert_eq!(stats.subscribers, 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for attempt in 1..=4 {
            bus.emit(CollabEvent::PeerReconnecting { peer_id: "p".into(), attempt });
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            CollabEvent::PeerReconnecting { peer_id: "p".into(), attempt: 3 }
        );
    }

    #[test]
    fn test_clones_share_channel() {
        let bus = EventBus::new(8);
        let clone = bus.clone();
        let _rx = bus.subscribe();
        assert_eq!(clone.subscriber_count(), 1);
        clone.emit(CollabEvent::SyncStarted);
        assert_eq!(bus.stats().events_emitted, 1);
    }
}

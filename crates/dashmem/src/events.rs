// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Fire-and-forget observation events.
//!
//! A bounded broadcast bus: publication never blocks and never errors the
//! producer; slow consumers lag and drop. This is telemetry, not a durable
//! log - nothing in the core depends on anyone listening.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default bus capacity. Lagging subscribers skip ahead past this window.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Observation points emitted by the memory core and executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MemoryEvent {
    /// A new entry landed.
    EntryStored {
        /// Entry id.
        id: String,
        /// Entry namespace.
        namespace: String,
    },
    /// An entry was patched.
    EntryUpdated {
        /// Entry id.
        id: String,
        /// New version.
        version: u64,
    },
    /// An entry was removed.
    EntryDeleted {
        /// Entry id.
        id: String,
    },
    /// An entry was read.
    EntryRetrieved {
        /// Entry id.
        id: String,
    },
    /// Cache served a read.
    CacheHit {
        /// Cache key.
        key: String,
    },
    /// Cache missed a read.
    CacheMiss {
        /// Cache key.
        key: String,
    },
    /// Cache evicted an entry under size/byte pressure.
    CacheEviction {
        /// Evicted key.
        key: String,
    },
    /// Cache dropped an expired entry.
    CacheExpired {
        /// Expired key.
        key: String,
    },
    /// Cache was cleared.
    CacheCleared {
        /// Entries removed.
        entries: usize,
    },
    /// Vector index accepted a point.
    IndexAdded {
        /// Point id.
        id: String,
    },
    /// Vector index removed a point.
    IndexRemoved {
        /// Point id.
        id: String,
    },
    /// Vector index was rebuilt.
    IndexRebuilt {
        /// Points re-inserted.
        count: usize,
    },
    /// A query ran to completion.
    QueryExecuted {
        /// Routed kind ("exact", "semantic", ...).
        kind: String,
        /// Result count.
        results: usize,
    },
    /// A task checkpoint was persisted.
    CheckpointSaved {
        /// Owning task.
        task_id: String,
        /// Checkpoint sequence number.
        sequence: u64,
    },
    /// Execution resumed from a checkpoint.
    CheckpointResumed {
        /// Owning task.
        task_id: String,
        /// Checkpoint id resumed from.
        checkpoint_id: String,
    },
    /// Old checkpoints were pruned.
    CheckpointPruned {
        /// Owning task.
        task_id: String,
        /// Checkpoints removed.
        removed: usize,
    },
    /// A long-running task started.
    TaskStarted {
        /// Task id.
        task_id: String,
    },
    /// A long-running task finished successfully.
    TaskCompleted {
        /// Task id.
        task_id: String,
    },
    /// A long-running task failed terminally.
    TaskFailed {
        /// Task id.
        task_id: String,
        /// Failure description.
        reason: String,
    },
    /// A long-running task was cancelled.
    TaskCancelled {
        /// Task id.
        task_id: String,
    },
    /// A step is being retried.
    TaskRetry {
        /// Task id.
        task_id: String,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// The worker pool grew.
    PoolScaledUp {
        /// New worker count.
        workers: usize,
    },
    /// The worker pool shrank.
    PoolScaledDown {
        /// New worker count.
        workers: usize,
    },
    /// An unhealthy worker was torn down and respawned.
    WorkerRecovered {
        /// Worker id.
        worker_id: String,
    },
    /// A migration run started.
    MigrationStarted {
        /// Entries discovered in the source.
        total: usize,
    },
    /// Migration progress tick.
    MigrationProgress {
        /// Entries migrated so far.
        migrated: usize,
        /// Entries discovered in the source.
        total: usize,
    },
    /// A migration run finished.
    MigrationCompleted {
        /// Entries migrated.
        migrated: usize,
    },
    /// A migration run failed.
    MigrationFailed {
        /// Failure description.
        reason: String,
    },
}

/// Bounded broadcast bus for [`MemoryEvent`].
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MemoryEvent>,
}

impl EventBus {
    /// Create a bus with the given ring capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a bus with [`DEFAULT_EVENT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Publish an event. Never blocks; a bus with no subscribers silently
    /// drops the event.
    pub fn publish(&self, event: MemoryEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(MemoryEvent::EntryDeleted {
            id: "x".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(MemoryEvent::EntryStored {
            id: "a".to_string(),
            namespace: "ns".to_string(),
        });
        bus.publish(MemoryEvent::EntryDeleted {
            id: "a".to_string(),
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, MemoryEvent::EntryStored { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, MemoryEvent::EntryDeleted { .. }));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_backpressuring() {
        let bus = EventBus::with_capacity(4);
        let mut rx = bus.subscribe();
        for i in 0..32 {
            bus.publish(MemoryEvent::CacheHit {
                key: format!("k{i}"),
            });
        }
        // The first recv reports the lag; the producer was never blocked.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            Ok(_) => {} // Small capacity timing may deliver the newest window.
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}

//! Controller events, published on a broadcast bus and mirrored to the log.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::operation::{ErrorKind, OperationKind};
use crate::types::VolumeId;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// An operation completed.
    OperationSucceeded {
        /// Operation kind.
        operation: OperationKind,
        /// Forced past an unsafe peer state.
        forced: bool,
        /// Backend was already in the requested state.
        no_op: bool,
    },
    /// An operation failed.
    OperationFailed {
        /// Operation kind.
        operation: OperationKind,
        /// Error kind.
        kind: ErrorKind,
        /// Will not be retried automatically.
        terminal: bool,
        /// Detail message.
        message: String,
    },
    /// A retry was scheduled.
    RetryScheduled {
        /// Consecutive failures so far.
        retry_count: u32,
        /// Delay before the retry.
        delay_ms: u64,
    },
    /// Replication was disabled and the finalizer removed.
    Finalized,
    /// A volume dropped from the intent had replication disabled and left the status.
    MemberReleased,
    /// A group member failed.
    GroupDegraded {
        /// First failing member.
        volume: VolumeId,
        /// Its error message.
        message: String,
    },
}

/// An event about one intent, optionally narrowed to a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    /// Monotonic sequence number.
    pub seq: u64,
    /// Intent name.
    pub intent: String,
    /// Volume concerned.
    pub volume: Option<VolumeId>,
    /// Event payload.
    pub kind: EventKind,
    /// Emission time.
    pub at: DateTime<Utc>,
}

impl ReplicationEvent {
    /// True for failure and degradation events.
    pub fn is_warning(&self) -> bool {
        matches!(
            self.kind,
            EventKind::OperationFailed { .. } | EventKind::GroupDegraded { .. }
        )
    }
}

/// Broadcast bus for [`ReplicationEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<ReplicationEvent>,
    seq: AtomicU64,
}

impl EventBus {
    /// Creates a bus retaining up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            seq: AtomicU64::new(0),
        }
    }

    /// Logs and publishes an event. Returns the number of subscribers reached.
    pub fn publish(&self, intent: &str, volume: Option<&VolumeId>, kind: EventKind) -> usize {
        let event = ReplicationEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            intent: intent.to_string(),
            volume: volume.cloned(),
            kind,
            at: Utc::now(),
        };
        let volume = event.volume.as_ref().map(|v| v.as_str()).unwrap_or("-");
        if event.is_warning() {
            warn!(intent = %event.intent, volume, event = ?event.kind, "replication event");
        } else {
            info!(intent = %event.intent, volume, event = ?event.kind, "replication event");
        }
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.sender.subscribe()
    }

    /// Active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

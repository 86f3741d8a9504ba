use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EntityType, OperationKind};
use crate::sync::OperatingMode;

/// Every observable state change of the sync subsystem produces an event.
/// The CLI prints them in `run` mode; dead operations are reported here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// Bootstrap finished, in whichever mode it could reach.
    Bootstrapped {
        mode: OperatingMode,
        at: DateTime<Utc>,
    },
    ConnectivityChanged {
        online: bool,
        at: DateTime<Utc>,
    },
    PassStarted {
        forced: bool,
        at: DateTime<Utc>,
    },
    PassCompleted {
        applied: usize,
        failed: usize,
        upserted: usize,
        removed: usize,
        at: DateTime<Utc>,
    },
    /// The backend confirmed a queued operation; it left the queue.
    OperationAcked {
        op_id: String,
        kind: OperationKind,
        entity_type: EntityType,
        entity_key: String,
    },
    /// Delivery failed and will be retried after a backoff.
    OperationFailed {
        op_id: String,
        attempts: u32,
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry budget exhausted. Needs `queue requeue` to be delivered again.
    OperationDead {
        op_id: String,
        entity_type: EntityType,
        entity_key: String,
        attempts: u32,
        error: String,
    },
    /// Local persistence failed; running remote-only until reset.
    LocalStoreDegraded {
        reason: String,
        at: DateTime<Utc>,
    },
    LocalStoreRestored {
        at: DateTime<Utc>,
    },
}

impl SyncEvent {
    /// Short name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Bootstrapped { .. } => "Bootstrapped",
            SyncEvent::ConnectivityChanged { .. } => "ConnectivityChanged",
            SyncEvent::PassStarted { .. } => "PassStarted",
            SyncEvent::PassCompleted { .. } => "PassCompleted",
            SyncEvent::OperationAcked { .. } => "OperationAcked",
            SyncEvent::OperationFailed { .. } => "OperationFailed",
            SyncEvent::OperationDead { .. } => "OperationDead",
            SyncEvent::LocalStoreDegraded { .. } => "LocalStoreDegraded",
            SyncEvent::LocalStoreRestored { .. } => "LocalStoreRestored",
        }
    }
}

//! Observed replication status, owned by the state machine and persisted to the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use volrep_transport::EndpointId;

use crate::operation::{ErrorKind, IdempotencyToken, OperationKind, VolumeInfo};
use crate::types::{ReplicationRole, VolumeId};

/// Per-volume state including in-progress substates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumeState {
    /// Never observed.
    #[default]
    Unknown,
    /// Replication disabled.
    Disabled,
    /// Settled secondary.
    Secondary,
    /// Settled primary.
    Primary,
    /// Enable in progress.
    Enabling,
    /// Disable in progress.
    Disabling,
    /// Promote in progress.
    Promoting,
    /// Demote in progress.
    Demoting,
    /// Resync in progress.
    Resyncing,
}

impl VolumeState {
    /// Settled state for a role.
    pub fn settled(role: ReplicationRole) -> Self {
        match role {
            ReplicationRole::Unknown => VolumeState::Unknown,
            ReplicationRole::Disabled => VolumeState::Disabled,
            ReplicationRole::Secondary => VolumeState::Secondary,
            ReplicationRole::Primary => VolumeState::Primary,
        }
    }

    /// In-progress substate for an operation; `None` for read-only queries.
    pub fn in_progress(kind: OperationKind) -> Option<Self> {
        match kind {
            OperationKind::Enable => Some(VolumeState::Enabling),
            OperationKind::Disable => Some(VolumeState::Disabling),
            OperationKind::Promote => Some(VolumeState::Promoting),
            OperationKind::Demote => Some(VolumeState::Demoting),
            OperationKind::Resync => Some(VolumeState::Resyncing),
            OperationKind::GetInfo => None,
        }
    }

    /// True for the transient substates.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VolumeState::Enabling
                | VolumeState::Disabling
                | VolumeState::Promoting
                | VolumeState::Demoting
                | VolumeState::Resyncing
        )
    }
}

/// Last classified failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Operation that failed.
    pub operation: OperationKind,
    /// Error kind.
    pub kind: ErrorKind,
    /// Detail message.
    pub message: String,
    /// Not retried automatically.
    pub terminal: bool,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Last successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Token it ran under.
    pub token: IdempotencyToken,
    /// Executed with the force override.
    pub forced: bool,
    /// The backend was already in the requested state.
    pub no_op: bool,
    /// Completion time.
    pub at: DateTime<Utc>,
}

/// A transition that has been issued but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Token reused by every retry of this transition.
    pub token: IdempotencyToken,
    /// First attempt time.
    pub started_at: DateTime<Utc>,
}

/// Conditions under which a terminal failure was recorded; automatic retries resume
/// only when one of them changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalBlock {
    /// Intent generation at failure time.
    pub generation: u64,
    /// Operator retry nonce at failure time.
    pub retry_nonce: u64,
    /// Whether deletion had been requested.
    pub deleting: bool,
}

/// Last-observed state of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// State including in-progress substates.
    pub state: VolumeState,
    /// Intent generation this status was last evaluated against.
    pub generation: u64,
    /// Settled role; changes only on confirmed success.
    pub current_role: ReplicationRole,
    /// Endpoint the last operation went to.
    pub endpoint: Option<EndpointId>,
    /// Last successful operation.
    pub last_operation: Option<LastOperation>,
    /// Issued, unconfirmed transition.
    pub pending: Option<PendingOperation>,
    /// Last classified failure.
    pub last_error: Option<LastError>,
    /// Set while waiting for an intent change after a terminal failure.
    pub blocked: Option<TerminalBlock>,
    /// Time of the last role/state change.
    pub last_transition_at: Option<DateTime<Utc>>,
    /// Consecutive retryable failures of the current transition.
    pub retry_count: u32,
    /// Earliest time the next attempt may run.
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Intent generation whose resync request has completed.
    pub resync_generation: Option<u64>,
    /// Last backend view from GetInfo or an operation reply.
    pub observed: Option<VolumeInfo>,
    /// When `observed` was refreshed.
    pub observed_at: Option<DateTime<Utc>>,
    /// No longer named by the intent; kept until replication is confirmed disabled.
    #[serde(default)]
    pub departing: bool,
}

impl ReplicationStatus {
    /// True if a terminal failure is waiting for operator action.
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// True if the last recorded operation is a successful disable.
    pub fn is_confirmed_disabled(&self) -> bool {
        self.current_role == ReplicationRole::Disabled
            && self
                .last_operation
                .as_ref()
                .is_some_and(|op| op.kind == OperationKind::Disable)
    }
}

/// Aggregate health of an intent's volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum GroupHealth {
    /// Every member converged without errors.
    Healthy,
    /// Members still converging, none failed.
    #[default]
    Progressing,
    /// At least one member is in a failure state.
    Degraded,
}

/// The failure reported for a degraded group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberFailure {
    /// Failing member.
    pub volume: VolumeId,
    /// Its terminal error.
    pub error: LastError,
}

/// Status persisted for one intent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Intent generation last reconciled.
    pub observed_generation: u64,
    /// Aggregate health.
    pub health: GroupHealth,
    /// Per-volume status.
    pub members: BTreeMap<VolumeId, ReplicationStatus>,
    /// First terminal member failure, in declaration order, then departing members.
    pub first_failure: Option<MemberFailure>,
    /// Intent-level validation failure; no operation runs until the intent changes.
    pub invalid: Option<String>,
}

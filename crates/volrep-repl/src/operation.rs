//! The six-operation driver contract: requests, wire responses and classified results.
//!
//! Raw driver failures ([`DriverError`]) never leave the operation adapter; they are
//! classified by [`classify`] into an [`OperationResult`] carrying an [`ErrorKind`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use volrep_transport::{BackoffHint, Opcode, TransportError};

use crate::error::{ReplError, Result};
use crate::types::{ReplicationRole, VolumeId};

/// Remote operations a storage-driver sidecar implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Start replication.
    Enable,
    /// Stop replication.
    Disable,
    /// Become primary.
    Promote,
    /// Become secondary.
    Demote,
    /// Reconcile divergent data.
    Resync,
    /// Read-only state query.
    GetInfo,
}

impl OperationKind {
    /// Wire opcode for this operation.
    pub fn opcode(&self) -> Opcode {
        match self {
            OperationKind::Enable => Opcode::Enable,
            OperationKind::Disable => Opcode::Disable,
            OperationKind::Promote => Opcode::Promote,
            OperationKind::Demote => Opcode::Demote,
            OperationKind::Resync => Opcode::Resync,
            OperationKind::GetInfo => Opcode::GetInfo,
        }
    }

    /// True for operations with side effects on the backend.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, OperationKind::GetInfo)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Stable identifier of one logical transition, reused across its retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// A fresh random token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One remote operation against one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Which operation.
    pub kind: OperationKind,
    /// Target volume.
    pub volume_id: VolumeId,
    /// Backend-specific parameter map.
    pub params: BTreeMap<String, String>,
    /// Override for promote/demote against unsafe peer state.
    pub force: bool,
    /// Idempotency token.
    pub token: IdempotencyToken,
}

impl OperationRequest {
    /// Builds a request with a fresh token.
    pub fn new(kind: OperationKind, volume_id: VolumeId) -> Self {
        Self {
            kind,
            volume_id,
            params: BTreeMap::new(),
            force: false,
            token: IdempotencyToken::generate(),
        }
    }

    /// Local validation performed before any remote call.
    pub fn validate(&self) -> Result<()> {
        if self.volume_id.as_str().is_empty() {
            return Err(ReplError::Validation {
                msg: "volume id is empty".to_string(),
            });
        }
        if self.token.as_str().is_empty() {
            return Err(ReplError::Validation {
                msg: "idempotency token is empty".to_string(),
            });
        }
        if self.force && !matches!(self.kind, OperationKind::Promote | OperationKind::Demote) {
            return Err(ReplError::Validation {
                msg: format!("force is not applicable to {}", self.kind),
            });
        }
        Ok(())
    }
}

/// Consistency of the local replica as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataState {
    /// In sync with the peer.
    Consistent,
    /// Catching up with the peer.
    Syncing,
    /// Diverged from the peer (split-brain).
    Diverged,
    /// The backend cannot tell.
    #[default]
    Unknown,
}

/// Backend view of a volume's replication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Role as seen by the backend.
    pub role: ReplicationRole,
    /// Data consistency.
    pub data_state: DataState,
    /// Whether the peer site answers.
    pub peer_reachable: bool,
    /// A resync is running.
    pub resyncing: bool,
    /// Last completed sync.
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Successful reply from a driver.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationReply {
    /// The operation was executed with the force override.
    pub forced: bool,
    /// The backend was already in the requested state; nothing changed.
    pub no_op: bool,
    /// Volume state after the operation, when the backend reports it.
    pub info: Option<VolumeInfo>,
}

/// Error codes a driver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorCode {
    /// Malformed parameters.
    InvalidArgument,
    /// Volume unknown or replication not enabled.
    NotFound,
    /// Enabled with different parameters, or another conflicting state.
    Conflict,
    /// Peer unreachable or data state unknown; force required.
    UnsafePeer,
    /// Another operation is in progress on the backend.
    Busy,
    /// The backend is temporarily unavailable.
    Unavailable,
    /// Unexpected backend failure.
    Internal,
}

/// Error reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct RemoteError {
    /// Error code.
    pub code: RemoteErrorCode,
    /// Human readable detail.
    pub message: String,
}

impl RemoteError {
    /// Builds a remote error.
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Wire response for every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResponse {
    /// Reply or error.
    pub outcome: std::result::Result<OperationReply, RemoteError>,
}

/// Unclassified failure of a driver call.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Channel or framing failure.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// The backend answered with an error.
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
    /// Payload could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(String),
    /// The operation deadline elapsed.
    #[error("deadline of {0}ms exceeded")]
    DeadlineExceeded(u64),
}

impl From<bincode::Error> for DriverError {
    fn from(e: bincode::Error) -> Self {
        DriverError::Codec(e.to_string())
    }
}

/// Closed error taxonomy surfaced in status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed parameters. Terminal.
    Validation,
    /// Endpoint unreachable or timed out. Retryable.
    Connection,
    /// Concurrent state mismatch. Terminal.
    Conflict,
    /// Promote/demote against unsafe peer state without force. Terminal.
    UnsafeOperation,
    /// Operation already in progress on the backend. Retryable with extended backoff.
    BackendBusy,
}

impl ErrorKind {
    /// True for kinds that are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::BackendBusy)
    }
}

/// Classified failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detail message.
    pub message: String,
}

impl FailureReason {
    /// Builds a failure reason.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of one operation after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// The backend is in the requested state.
    Success(OperationReply),
    /// Transient failure; retry with backoff.
    RetryableFailure {
        /// What failed.
        reason: FailureReason,
        /// How long the caller should back off.
        hint: BackoffHint,
    },
    /// Permanent failure; do not retry without an intent change.
    TerminalFailure(FailureReason),
}

impl OperationResult {
    /// True on success.
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success(_))
    }

    /// The failure reason, if any.
    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            OperationResult::Success(_) => None,
            OperationResult::RetryableFailure { reason, .. } => Some(reason),
            OperationResult::TerminalFailure(reason) => Some(reason),
        }
    }

    /// Terminal validation failure from a local error.
    pub fn invalid(err: &ReplError) -> Self {
        OperationResult::TerminalFailure(FailureReason::new(ErrorKind::Validation, err.to_string()))
    }
}

/// Maps a raw driver failure onto the error taxonomy.
pub fn classify(error: &DriverError) -> OperationResult {
    let retry = |kind, hint, message: String| OperationResult::RetryableFailure {
        reason: FailureReason::new(kind, message),
        hint,
    };
    let terminal = |kind, message: String| {
        OperationResult::TerminalFailure(FailureReason::new(kind, message))
    };

    match error {
        DriverError::Transport(e) => match e {
            TransportError::UnknownOpcode(_)
            | TransportError::VersionMismatch { .. }
            | TransportError::PayloadTooLarge { .. }
            | TransportError::SerializationError(_) => terminal(ErrorKind::Validation, e.to_string()),
            _ => retry(ErrorKind::Connection, BackoffHint::Default, e.to_string()),
        },
        DriverError::DeadlineExceeded(_) => {
            retry(ErrorKind::Connection, BackoffHint::Default, error.to_string())
        }
        DriverError::Codec(msg) => terminal(ErrorKind::Validation, format!("codec: {}", msg)),
        DriverError::Remote(remote) => match remote.code {
            RemoteErrorCode::InvalidArgument | RemoteErrorCode::NotFound => {
                terminal(ErrorKind::Validation, remote.message.clone())
            }
            RemoteErrorCode::Conflict => terminal(ErrorKind::Conflict, remote.message.clone()),
            RemoteErrorCode::UnsafePeer => {
                terminal(ErrorKind::UnsafeOperation, remote.message.clone())
            }
            RemoteErrorCode::Busy => retry(
                ErrorKind::BackendBusy,
                BackoffHint::Extended,
                remote.message.clone(),
            ),
            RemoteErrorCode::Unavailable | RemoteErrorCode::Internal => retry(
                ErrorKind::Connection,
                BackoffHint::Default,
                remote.message.clone(),
            ),
        },
    }
}

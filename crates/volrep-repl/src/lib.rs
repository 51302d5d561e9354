#![warn(missing_docs)]

//! volrep replication subsystem: intent-driven volume replication state machine,
//! per-volume operation serialization, and the reconciliation scheduler

pub mod adapter;
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod group;
pub mod machine;
pub mod operation;
pub mod scheduler;
pub mod serializer;
pub mod sidecar;
pub mod status;
pub mod store;
pub mod types;

pub use adapter::{OperationAdapter, DEFAULT_OPERATION_DEADLINE};
pub use config::{load_intents, ControllerConfig, TransportSettings};
pub use driver::{
    dispatch, DriverResolver, DriverService, RemoteDriverResolver, ReplicationDriver, RpcDriver,
    StaticDriverResolver,
};
pub use endpoint::{EndpointResolver, StaticEndpointResolver};
pub use error::{ReplError, Result};
pub use events::{EventBus, EventKind, ReplicationEvent};
pub use machine::{Plan, ReplicationStateMachine, StepOutcome, VolumeContext, DEFAULT_REFRESH_INTERVAL};
pub use operation::{
    classify, DataState, DriverError, ErrorKind, FailureReason, IdempotencyToken, OperationKind,
    OperationReply, OperationRequest, OperationResult, RemoteError, RemoteErrorCode, VolumeInfo,
};
pub use scheduler::{spawn_eviction, Controller, ControllerOptions, PassOutcome};
pub use serializer::{Admission, ReconcileQueue, ReconcileTrigger, VolumeLocks};
pub use sidecar::{Fault, SideEffects, SimulatedBackend};
pub use status::{
    GroupHealth, LastError, LastOperation, MemberFailure, PendingOperation, ReplicationStatus,
    ResourceStatus, TerminalBlock, VolumeState,
};
pub use store::{
    IntentStore, MemoryStore, ResourceMeta, StoreError, StoredIntent, WatchEvent, WatchEventKind,
    REPLICATION_FINALIZER,
};
pub use types::{
    DesiredRole, MirroringMode, ReplicationClass, ReplicationIntent, ReplicationParams,
    ReplicationRole, ReplicationTarget, VolumeId,
};

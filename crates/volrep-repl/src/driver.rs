//! Driver capability interface and its implementations.
//!
//! Every storage driver exposes the same fixed capability set. The implementation used
//! for a call is selected by endpoint identity through a [`DriverResolver`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use volrep_transport::{
    ChannelLease, ChannelRegistry, EndpointId, Opcode, RpcClient, RpcConnector, RpcHandler,
    TransportError,
};

use crate::operation::{
    DriverError, OperationKind, OperationReply, OperationRequest, OperationResponse, RemoteError,
    RemoteErrorCode,
};

/// The six-operation contract implemented per endpoint.
#[async_trait]
pub trait ReplicationDriver: Send + Sync {
    /// Start replication; no-op if enabled with the same parameters.
    async fn enable(&self, request: &OperationRequest) -> Result<OperationReply, DriverError>;
    /// Stop replication; no-op if already disabled.
    async fn disable(&self, request: &OperationRequest) -> Result<OperationReply, DriverError>;
    /// Become primary; no-op if already primary.
    async fn promote(&self, request: &OperationRequest) -> Result<OperationReply, DriverError>;
    /// Become secondary; no-op if already secondary.
    async fn demote(&self, request: &OperationRequest) -> Result<OperationReply, DriverError>;
    /// Reconcile divergent data; no-op while a resync is running.
    async fn resync(&self, request: &OperationRequest) -> Result<OperationReply, DriverError>;
    /// Read-only state query.
    async fn get_info(&self, request: &OperationRequest) -> Result<OperationReply, DriverError>;
}

/// Routes a request to the matching driver method.
pub async fn dispatch(
    driver: &dyn ReplicationDriver,
    request: &OperationRequest,
) -> Result<OperationReply, DriverError> {
    match request.kind {
        OperationKind::Enable => driver.enable(request).await,
        OperationKind::Disable => driver.disable(request).await,
        OperationKind::Promote => driver.promote(request).await,
        OperationKind::Demote => driver.demote(request).await,
        OperationKind::Resync => driver.resync(request).await,
        OperationKind::GetInfo => driver.get_info(request).await,
    }
}

/// Driver reached over a pooled RPC channel.
pub struct RpcDriver {
    lease: ChannelLease<RpcClient>,
    deadline: Duration,
}

impl RpcDriver {
    /// Wraps a leased channel.
    pub fn new(lease: ChannelLease<RpcClient>, deadline: Duration) -> Self {
        Self { lease, deadline }
    }

    async fn call(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        let payload = bincode::serialize(request)?;
        let frame = self
            .lease
            .channel()
            .call_with_deadline(request.kind.opcode(), payload, self.deadline)
            .await
            .inspect_err(|e| {
                if e.breaks_channel() {
                    self.lease.mark_unhealthy();
                }
            })?;
        let response: OperationResponse = bincode::deserialize(&frame.payload)?;
        response.outcome.map_err(DriverError::Remote)
    }
}

#[async_trait]
impl ReplicationDriver for RpcDriver {
    async fn enable(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.call(request).await
    }

    async fn disable(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.call(request).await
    }

    async fn promote(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.call(request).await
    }

    async fn demote(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.call(request).await
    }

    async fn resync(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.call(request).await
    }

    async fn get_info(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.call(request).await
    }
}

/// Selects the driver implementation for an endpoint.
#[async_trait]
pub trait DriverResolver: Send + Sync {
    /// Returns a driver bound to `endpoint`.
    async fn resolve(&self, endpoint: &EndpointId)
        -> Result<Arc<dyn ReplicationDriver>, DriverError>;
}

/// Resolves endpoints to RPC drivers backed by the channel registry.
pub struct RemoteDriverResolver {
    registry: Arc<ChannelRegistry<RpcConnector>>,
    deadline: Duration,
}

impl RemoteDriverResolver {
    /// Creates a resolver issuing calls with the given per-operation deadline.
    pub fn new(registry: Arc<ChannelRegistry<RpcConnector>>, deadline: Duration) -> Self {
        Self { registry, deadline }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<ChannelRegistry<RpcConnector>> {
        &self.registry
    }
}

#[async_trait]
impl DriverResolver for RemoteDriverResolver {
    async fn resolve(
        &self,
        endpoint: &EndpointId,
    ) -> Result<Arc<dyn ReplicationDriver>, DriverError> {
        let lease = self.registry.acquire(endpoint).await?;
        Ok(Arc::new(RpcDriver::new(lease, self.deadline)))
    }
}

/// Fixed endpoint-to-driver table, used for in-process drivers.
#[derive(Default)]
pub struct StaticDriverResolver {
    drivers: RwLock<HashMap<EndpointId, Arc<dyn ReplicationDriver>>>,
}

impl StaticDriverResolver {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `driver` to `endpoint`, replacing any previous binding.
    pub fn register(&self, endpoint: EndpointId, driver: Arc<dyn ReplicationDriver>) {
        let mut drivers = self.drivers.write().unwrap_or_else(|p| p.into_inner());
        drivers.insert(endpoint, driver);
    }
}

#[async_trait]
impl DriverResolver for StaticDriverResolver {
    async fn resolve(
        &self,
        endpoint: &EndpointId,
    ) -> Result<Arc<dyn ReplicationDriver>, DriverError> {
        let drivers = self.drivers.read().unwrap_or_else(|p| p.into_inner());
        drivers.get(endpoint).cloned().ok_or_else(|| {
            DriverError::Transport(TransportError::ConnectionRefused {
                addr: endpoint.to_string(),
            })
        })
    }
}

/// Serves a [`ReplicationDriver`] over the RPC protocol (sidecar side).
pub struct DriverService {
    driver: Arc<dyn ReplicationDriver>,
}

impl DriverService {
    /// Wraps a driver.
    pub fn new(driver: Arc<dyn ReplicationDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl RpcHandler for DriverService {
    async fn handle(&self, opcode: Opcode, payload: Vec<u8>) -> volrep_transport::Result<Vec<u8>> {
        if opcode == Opcode::Ping {
            return Ok(Vec::new());
        }
        let request: OperationRequest = bincode::deserialize(&payload)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        let outcome = if request.kind.opcode() != opcode {
            Err(RemoteError::new(
                RemoteErrorCode::InvalidArgument,
                format!("opcode {:?} does not match operation {}", opcode, request.kind),
            ))
        } else {
            match dispatch(self.driver.as_ref(), &request).await {
                Ok(reply) => Ok(reply),
                Err(DriverError::Remote(remote)) => Err(remote),
                Err(other) => {
                    warn!(volume = %request.volume_id, error = %other, "driver failure");
                    Err(RemoteError::new(RemoteErrorCode::Internal, other.to_string()))
                }
            }
        };
        debug!(volume = %request.volume_id, op = ?request.kind, ok = outcome.is_ok(), "served operation");
        bincode::serialize(&OperationResponse { outcome })
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }
}

//! In-memory storage-driver backend.
//!
//! Implements the driver contract with the backend-side idempotency rules: matching
//! re-enables, repeated role changes and resyncs already in progress are no-ops, and a
//! replayed idempotency token returns the original reply without side effects. Faults
//! can be queued per volume. `volrepd sidecar` serves it over TCP.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::driver::ReplicationDriver;
use crate::operation::{
    DataState, DriverError, IdempotencyToken, OperationKind, OperationReply, OperationRequest,
    RemoteError, RemoteErrorCode, VolumeInfo,
};
use crate::types::{ReplicationRole, VolumeId};

/// A fault consumed by the next operation on a volume.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Never answer; the caller's deadline fires.
    Hang,
    /// Answer after a delay, then proceed normally.
    Delay(Duration),
    /// Fail with the given error.
    Error(RemoteError),
}

/// Side effects applied to one volume, for idempotence checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SideEffects {
    /// Replication started.
    pub enables: u32,
    /// Replication stopped.
    pub disables: u32,
    /// Became primary.
    pub promotions: u32,
    /// Became secondary by demotion.
    pub demotions: u32,
    /// Resyncs triggered.
    pub resyncs: u32,
}

#[derive(Debug, Clone)]
struct SimVolume {
    params: Option<BTreeMap<String, String>>,
    role: ReplicationRole,
    data_state: DataState,
    peer_reachable: bool,
    resyncing: bool,
    last_sync_at: Option<chrono::DateTime<Utc>>,
}

impl Default for SimVolume {
    fn default() -> Self {
        Self {
            params: None,
            role: ReplicationRole::Disabled,
            data_state: DataState::Unknown,
            peer_reachable: true,
            resyncing: false,
            last_sync_at: None,
        }
    }
}

impl SimVolume {
    fn info(&self) -> VolumeInfo {
        VolumeInfo {
            role: self.role,
            data_state: self.data_state,
            peer_reachable: self.peer_reachable,
            resyncing: self.resyncing,
            last_sync_at: self.last_sync_at,
        }
    }

    fn unsafe_reason(&self) -> Option<&'static str> {
        if !self.peer_reachable {
            Some("peer is unreachable")
        } else if matches!(self.data_state, DataState::Unknown | DataState::Diverged) {
            Some("local data state is not known to be consistent")
        } else {
            None
        }
    }
}

#[derive(Default)]
struct SimState {
    volumes: HashMap<VolumeId, SimVolume>,
    effects: HashMap<VolumeId, SideEffects>,
    faults: HashMap<VolumeId, VecDeque<Fault>>,
    applied: HashMap<IdempotencyToken, OperationReply>,
    calls: u64,
}

/// Simulated storage backend.
#[derive(Default)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `count` copies of `fault` for the next operations on `volume`.
    pub async fn inject(&self, volume: &VolumeId, fault: Fault, count: usize) {
        let mut state = self.state.lock().await;
        let queue = state.faults.entry(volume.clone()).or_default();
        for _ in 0..count {
            queue.push_back(fault.clone());
        }
    }

    /// Sets whether the volume's peer answers.
    pub async fn set_peer_reachable(&self, volume: &VolumeId, reachable: bool) {
        let mut state = self.state.lock().await;
        state.volumes.entry(volume.clone()).or_default().peer_reachable = reachable;
    }

    /// Overrides the data state, e.g. to simulate split-brain.
    pub async fn set_data_state(&self, volume: &VolumeId, data_state: DataState) {
        let mut state = self.state.lock().await;
        state.volumes.entry(volume.clone()).or_default().data_state = data_state;
    }

    /// Completes a running resync.
    pub async fn finish_resync(&self, volume: &VolumeId) {
        let mut state = self.state.lock().await;
        if let Some(vol) = state.volumes.get_mut(volume) {
            vol.resyncing = false;
            vol.data_state = DataState::Consistent;
            vol.last_sync_at = Some(Utc::now());
        }
    }

    /// Side effects applied to `volume` so far.
    pub async fn side_effects(&self, volume: &VolumeId) -> SideEffects {
        let state = self.state.lock().await;
        state.effects.get(volume).copied().unwrap_or_default()
    }

    /// Current backend view of `volume`.
    pub async fn info(&self, volume: &VolumeId) -> VolumeInfo {
        let state = self.state.lock().await;
        state.volumes.get(volume).cloned().unwrap_or_default().info()
    }

    /// Total operations received, including failed ones.
    pub async fn call_count(&self) -> u64 {
        self.state.lock().await.calls
    }

    async fn take_fault(&self, volume: &VolumeId) -> Option<Fault> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        state.faults.get_mut(volume).and_then(|q| q.pop_front())
    }

    async fn apply(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        match self.take_fault(&request.volume_id).await {
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
            }
            Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(Fault::Error(err)) => return Err(DriverError::Remote(err)),
            None => {}
        }

        let mut state = self.state.lock().await;
        if request.kind.is_mutating() {
            if let Some(reply) = state.applied.get(&request.token) {
                debug!(volume = %request.volume_id, token = %request.token, "replayed token");
                return Ok(reply.clone());
            }
        }

        let state = &mut *state;
        let volume = state.volumes.entry(request.volume_id.clone()).or_default();
        let effects = state.effects.entry(request.volume_id.clone()).or_default();
        let reply = Self::transition(volume, effects, request)?;
        if request.kind.is_mutating() && !reply.no_op {
            info!(volume = %request.volume_id, op = ?request.kind, forced = reply.forced, "backend transition applied");
        }
        if request.kind.is_mutating() {
            state.applied.insert(request.token.clone(), reply.clone());
        }
        Ok(reply)
    }

    fn transition(
        volume: &mut SimVolume,
        effects: &mut SideEffects,
        request: &OperationRequest,
    ) -> Result<OperationReply, DriverError> {
        let no_op = |volume: &SimVolume| OperationReply {
            forced: false,
            no_op: true,
            info: Some(volume.info()),
        };
        let not_enabled = || {
            DriverError::Remote(RemoteError::new(
                RemoteErrorCode::NotFound,
                format!("replication is not enabled for {}", request.volume_id),
            ))
        };

        match request.kind {
            OperationKind::GetInfo => Ok(OperationReply {
                forced: false,
                no_op: true,
                info: Some(volume.info()),
            }),
            OperationKind::Enable => match &volume.params {
                Some(existing) if *existing == request.params => Ok(no_op(volume)),
                Some(_) => Err(DriverError::Remote(RemoteError::new(
                    RemoteErrorCode::Conflict,
                    format!("{} is enabled with different parameters", request.volume_id),
                ))),
                None => {
                    volume.params = Some(request.params.clone());
                    volume.role = ReplicationRole::Secondary;
                    volume.data_state = DataState::Consistent;
                    effects.enables += 1;
                    Ok(OperationReply {
                        forced: false,
                        no_op: false,
                        info: Some(volume.info()),
                    })
                }
            },
            OperationKind::Disable => {
                if volume.params.is_none() {
                    return Ok(no_op(volume));
                }
                volume.params = None;
                volume.role = ReplicationRole::Disabled;
                volume.resyncing = false;
                effects.disables += 1;
                Ok(OperationReply {
                    forced: false,
                    no_op: false,
                    info: Some(volume.info()),
                })
            }
            OperationKind::Promote | OperationKind::Demote => {
                if volume.params.is_none() {
                    return Err(not_enabled());
                }
                let target = if request.kind == OperationKind::Promote {
                    ReplicationRole::Primary
                } else {
                    ReplicationRole::Secondary
                };
                if volume.role == target {
                    return Ok(no_op(volume));
                }
                if let Some(reason) = volume.unsafe_reason() {
                    if !request.force {
                        return Err(DriverError::Remote(RemoteError::new(
                            RemoteErrorCode::UnsafePeer,
                            format!("refusing {} of {}: {}", request.kind, request.volume_id, reason),
                        )));
                    }
                }
                volume.role = target;
                if request.kind == OperationKind::Promote {
                    effects.promotions += 1;
                } else {
                    effects.demotions += 1;
                }
                Ok(OperationReply {
                    forced: request.force,
                    no_op: false,
                    info: Some(volume.info()),
                })
            }
            OperationKind::Resync => {
                if volume.params.is_none() {
                    return Err(not_enabled());
                }
                if volume.resyncing {
                    return Ok(no_op(volume));
                }
                volume.resyncing = true;
                volume.data_state = DataState::Syncing;
                effects.resyncs += 1;
                Ok(OperationReply {
                    forced: false,
                    no_op: false,
                    info: Some(volume.info()),
                })
            }
        }
    }
}

#[async_trait]
impl ReplicationDriver for SimulatedBackend {
    async fn enable(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.apply(request).await
    }

    async fn disable(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.apply(request).await
    }

    async fn promote(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.apply(request).await
    }

    async fn demote(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.apply(request).await
    }

    async fn resync(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.apply(request).await
    }

    async fn get_info(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.apply(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::dispatch;

    fn request(kind: OperationKind, volume: &str) -> OperationRequest {
        let mut request = OperationRequest::new(kind, VolumeId::new(volume));
        request
            .params
            .insert("mirroringMode".to_string(), "snapshot".to_string());
        request
    }

    async fn enabled(backend: &SimulatedBackend, volume: &str) {
        dispatch(backend, &request(OperationKind::Enable, volume))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enable_twice_single_side_effect() {
        let backend = SimulatedBackend::new();
        let first = dispatch(&backend, &request(OperationKind::Enable, "v1")).await.unwrap();
        let second = dispatch(&backend, &request(OperationKind::Enable, "v1")).await.unwrap();
        assert!(!first.no_op);
        assert!(second.no_op);
        assert_eq!(backend.side_effects(&VolumeId::new("v1")).await.enables, 1);
    }

    #[tokio::test]
    async fn test_enable_conflicting_params() {
        let backend = SimulatedBackend::new();
        enabled(&backend, "v1").await;
        let mut conflicting = request(OperationKind::Enable, "v1");
        conflicting
            .params
            .insert("mirroringMode".to_string(), "journal".to_string());
        match dispatch(&backend, &conflicting).await {
            Err(DriverError::Remote(e)) => assert_eq!(e.code, RemoteErrorCode::Conflict),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_promote_already_primary_is_no_op() {
        let backend = SimulatedBackend::new();
        enabled(&backend, "v1").await;
        dispatch(&backend, &request(OperationKind::Promote, "v1")).await.unwrap();
        let again = dispatch(&backend, &request(OperationKind::Promote, "v1")).await.unwrap();
        assert!(again.no_op);
        assert_eq!(backend.side_effects(&VolumeId::new("v1")).await.promotions, 1);
    }

    #[tokio::test]
    async fn test_unsafe_demote_requires_force() {
        let backend = SimulatedBackend::new();
        let vol = VolumeId::new("v1");
        enabled(&backend, "v1").await;
        dispatch(&backend, &request(OperationKind::Promote, "v1")).await.unwrap();
        backend.set_peer_reachable(&vol, false).await;

        match dispatch(&backend, &request(OperationKind::Demote, "v1")).await {
            Err(DriverError::Remote(e)) => assert_eq!(e.code, RemoteErrorCode::UnsafePeer),
            other => panic!("expected unsafe peer, got {:?}", other),
        }

        let mut forced = request(OperationKind::Demote, "v1");
        forced.force = true;
        let reply = dispatch(&backend, &forced).await.unwrap();
        assert!(reply.forced);
        assert_eq!(backend.info(&vol).await.role, ReplicationRole::Secondary);
    }

    #[tokio::test]
    async fn test_replayed_token_has_no_side_effect() {
        let backend = SimulatedBackend::new();
        enabled(&backend, "v1").await;
        let resync = request(OperationKind::Resync, "v1");
        dispatch(&backend, &resync).await.unwrap();
        backend.finish_resync(&VolumeId::new("v1")).await;

        let replay = dispatch(&backend, &resync).await.unwrap();
        assert!(!replay.no_op);
        assert_eq!(backend.side_effects(&VolumeId::new("v1")).await.resyncs, 1);
    }

    #[tokio::test]
    async fn test_resync_while_resyncing_is_no_op() {
        let backend = SimulatedBackend::new();
        enabled(&backend, "v1").await;
        dispatch(&backend, &request(OperationKind::Resync, "v1")).await.unwrap();
        let second = dispatch(&backend, &request(OperationKind::Resync, "v1")).await.unwrap();
        assert!(second.no_op);
        assert_eq!(backend.side_effects(&VolumeId::new("v1")).await.resyncs, 1);
    }

    #[tokio::test]
    async fn test_disable_when_disabled_is_no_op() {
        let backend = SimulatedBackend::new();
        let reply = dispatch(&backend, &request(OperationKind::Disable, "v9")).await.unwrap();
        assert!(reply.no_op);
        assert_eq!(backend.side_effects(&VolumeId::new("v9")).await, SideEffects::default());
    }

    #[tokio::test]
    async fn test_injected_error_consumed_once() {
        let backend = SimulatedBackend::new();
        let vol = VolumeId::new("v1");
        backend
            .inject(
                &vol,
                Fault::Error(RemoteError::new(RemoteErrorCode::Busy, "snapshot in progress")),
                1,
            )
            .await;
        assert!(dispatch(&backend, &request(OperationKind::Enable, "v1")).await.is_err());
        assert!(dispatch(&backend, &request(OperationKind::Enable, "v1")).await.is_ok());
        assert_eq!(backend.call_count().await, 2);
    }
}

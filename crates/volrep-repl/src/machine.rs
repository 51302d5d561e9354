//! Replication state machine.
//!
//! Compares the declared intent against the recorded status of one volume, chooses the
//! next operation, and folds the classified result back into the status. Retry state is
//! kept in the status itself so a restarted controller honours the same backoff window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use volrep_transport::{BackoffPolicy, EndpointId};

use crate::adapter::OperationAdapter;
use crate::operation::{IdempotencyToken, OperationKind, OperationRequest, OperationResult};
use crate::status::{
    LastError, LastOperation, PendingOperation, ReplicationStatus, TerminalBlock, VolumeState,
};
use crate::types::{DesiredRole, ReplicationIntent, ReplicationRole, VolumeId};

/// Default interval between backend state refreshes of a converged volume.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Everything the machine needs to know about one volume's intent.
#[derive(Debug, Clone, Copy)]
pub struct VolumeContext<'a> {
    /// Owning intent.
    pub intent: &'a ReplicationIntent,
    /// Volume being reconciled.
    pub volume: &'a VolumeId,
    /// Endpoint serving the volume.
    pub endpoint: &'a EndpointId,
    /// Intent generation.
    pub generation: u64,
    /// Deletion of the intent has been requested.
    pub deleting: bool,
}

impl VolumeContext<'_> {
    fn block(&self) -> TerminalBlock {
        TerminalBlock {
            generation: self.generation,
            retry_nonce: self.intent.retry_nonce,
            deleting: self.deleting,
        }
    }

    fn resync_requested(&self, status: &ReplicationStatus) -> bool {
        self.intent.resync && status.resync_generation != Some(self.generation)
    }
}

/// Where a volume stands after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Observed state matches the intent.
    Converged,
    /// An operation succeeded; another step may be needed.
    Progressed,
    /// Nothing may run before the delay elapses.
    RetryAfter(Duration),
    /// A terminal failure is waiting for an intent change or operator retry.
    Blocked,
    /// Replication is confirmed disabled for a deleted intent.
    Finalized,
}

/// Decision taken by [`ReplicationStateMachine::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Issue this request, then feed its result to `apply`.
    Execute(OperationRequest),
    /// No operation; the volume is in this position.
    Done(StepOutcome),
}

/// Drives individual volumes towards their intent.
pub struct ReplicationStateMachine {
    adapter: Arc<OperationAdapter>,
    backoff: BackoffPolicy,
    refresh_interval: Duration,
}

impl ReplicationStateMachine {
    /// Creates a state machine issuing operations through `adapter`.
    pub fn new(adapter: Arc<OperationAdapter>, backoff: BackoffPolicy, refresh_interval: Duration) -> Self {
        Self {
            adapter,
            backoff,
            refresh_interval,
        }
    }

    /// The operation adapter.
    pub fn adapter(&self) -> &Arc<OperationAdapter> {
        &self.adapter
    }

    /// The backoff policy.
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// The operation that moves `status` towards the intent, if any.
    pub fn next_operation(
        &self,
        ctx: &VolumeContext<'_>,
        status: &ReplicationStatus,
        now: DateTime<Utc>,
    ) -> Option<OperationKind> {
        if ctx.deleting {
            return (!status.is_confirmed_disabled()).then_some(OperationKind::Disable);
        }
        let role = status.current_role;
        if !role.is_enabled() {
            return Some(OperationKind::Enable);
        }
        match (ctx.intent.desired_role, role) {
            (DesiredRole::Primary, ReplicationRole::Secondary) => return Some(OperationKind::Promote),
            (DesiredRole::Secondary, ReplicationRole::Primary) => return Some(OperationKind::Demote),
            _ => {}
        }
        if ctx.resync_requested(status) {
            return Some(OperationKind::Resync);
        }
        let stale = status.observed_at.map_or(true, |at| {
            (now - at).to_std().unwrap_or(Duration::ZERO) >= self.refresh_interval
        });
        stale.then_some(OperationKind::GetInfo)
    }

    /// Chooses the next request and marks it in progress in `status`.
    ///
    /// The status must be persisted after a [`Plan::Execute`] so a crash mid-call
    /// leaves the pending token on record and the retry reuses it.
    pub fn plan(&self, ctx: &VolumeContext<'_>, status: &mut ReplicationStatus, now: DateTime<Utc>) -> Plan {
        if status.generation != ctx.generation {
            status.generation = ctx.generation;
            status.retry_count = 0;
            status.next_eligible_at = None;
        }

        if let Some(block) = status.blocked {
            if block == ctx.block() {
                return Plan::Done(StepOutcome::Blocked);
            }
            info!(volume = %ctx.volume, generation = ctx.generation, retry_nonce = ctx.intent.retry_nonce, "retrying after terminal failure");
            status.blocked = None;
            status.last_error = None;
            status.retry_count = 0;
            status.next_eligible_at = None;
        }

        let Some(kind) = self.next_operation(ctx, status, now) else {
            if let Some(pending) = status.pending.take() {
                debug!(volume = %ctx.volume, op = %pending.kind, "pending operation superseded");
            }
            status.state = VolumeState::settled(status.current_role);
            let outcome = if ctx.deleting {
                StepOutcome::Finalized
            } else {
                StepOutcome::Converged
            };
            return Plan::Done(outcome);
        };

        if status.pending.as_ref().is_some_and(|p| p.kind != kind) {
            debug!(volume = %ctx.volume, op = %kind, "pending operation replaced");
            status.pending = None;
            status.retry_count = 0;
            status.next_eligible_at = None;
        }

        if let Some(at) = status.next_eligible_at {
            if at > now {
                let remaining = (at - now).to_std().unwrap_or(Duration::ZERO);
                return Plan::Done(StepOutcome::RetryAfter(remaining));
            }
        }

        let token = match &status.pending {
            Some(pending) => pending.token.clone(),
            None => IdempotencyToken::generate(),
        };
        let mut request = OperationRequest::new(kind, ctx.volume.clone());
        request.token = token.clone();
        request.params = ctx.intent.wire_params();
        request.force =
            ctx.intent.force && matches!(kind, OperationKind::Promote | OperationKind::Demote);

        if kind.is_mutating() && status.pending.is_none() {
            status.pending = Some(PendingOperation {
                kind,
                token,
                started_at: now,
            });
        }
        if let Some(state) = VolumeState::in_progress(kind) {
            status.state = state;
        }
        status.endpoint = Some(ctx.endpoint.clone());
        Plan::Execute(request)
    }

    /// Folds a classified result into `status`.
    pub fn apply(
        &self,
        ctx: &VolumeContext<'_>,
        request: &OperationRequest,
        result: &OperationResult,
        status: &mut ReplicationStatus,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        let kind = request.kind;
        match result {
            OperationResult::Success(reply) => {
                let previous = (status.current_role, status.state);
                if let Some(info) = &reply.info {
                    status.observed = Some(info.clone());
                    status.observed_at = Some(now);
                }
                match kind {
                    OperationKind::Enable => {
                        status.current_role = reply
                            .info
                            .as_ref()
                            .map(|info| info.role)
                            .filter(ReplicationRole::is_enabled)
                            .unwrap_or(ReplicationRole::Secondary);
                    }
                    OperationKind::Disable => status.current_role = ReplicationRole::Disabled,
                    OperationKind::Promote => status.current_role = ReplicationRole::Primary,
                    OperationKind::Demote => status.current_role = ReplicationRole::Secondary,
                    OperationKind::Resync => status.resync_generation = Some(ctx.generation),
                    OperationKind::GetInfo => {
                        if let Some(info) = &reply.info {
                            if info.role != ReplicationRole::Unknown
                                && info.role != status.current_role
                            {
                                warn!(
                                    volume = %ctx.volume,
                                    recorded = ?status.current_role,
                                    backend = ?info.role,
                                    "backend role drifted"
                                );
                                status.current_role = info.role;
                            }
                        }
                    }
                }
                if kind.is_mutating() {
                    status.last_operation = Some(LastOperation {
                        kind,
                        token: request.token.clone(),
                        forced: reply.forced,
                        no_op: reply.no_op,
                        at: now,
                    });
                }
                status.pending = None;
                status.last_error = None;
                status.blocked = None;
                status.retry_count = 0;
                status.next_eligible_at = None;
                status.state = VolumeState::settled(status.current_role);
                if (status.current_role, status.state) != previous || kind == OperationKind::Resync {
                    status.last_transition_at = Some(now);
                }
                StepOutcome::Progressed
            }
            OperationResult::RetryableFailure { reason, hint } => {
                status.retry_count = status.retry_count.saturating_add(1);
                let delay = self.backoff.delay(status.retry_count, *hint);
                status.next_eligible_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
                status.last_error = Some(LastError {
                    operation: kind,
                    kind: reason.kind,
                    message: reason.message.clone(),
                    terminal: false,
                    at: now,
                });
                if !kind.is_mutating() {
                    status.state = VolumeState::settled(status.current_role);
                }
                debug!(volume = %ctx.volume, op = %kind, retry = status.retry_count, delay_ms = delay.as_millis() as u64, "retry scheduled");
                StepOutcome::RetryAfter(delay)
            }
            OperationResult::TerminalFailure(reason) => {
                status.last_error = Some(LastError {
                    operation: kind,
                    kind: reason.kind,
                    message: reason.message.clone(),
                    terminal: true,
                    at: now,
                });
                status.blocked = Some(ctx.block());
                status.pending = None;
                status.next_eligible_at = None;
                status.state = VolumeState::settled(status.current_role);
                StepOutcome::Blocked
            }
        }
    }

    /// Plans, executes and applies a single operation.
    pub async fn step(&self, ctx: &VolumeContext<'_>, status: &mut ReplicationStatus) -> StepOutcome {
        match self.plan(ctx, status, Utc::now()) {
            Plan::Done(outcome) => outcome,
            Plan::Execute(request) => {
                let result = self.adapter.execute(ctx.endpoint, &request).await;
                self.apply(ctx, &request, &result, status, Utc::now())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::StaticDriverResolver;
    use crate::operation::{DataState, ErrorKind, RemoteError, RemoteErrorCode};
    use crate::sidecar::{Fault, SimulatedBackend};
    use volrep_transport::{BackoffConfig, BackoffHint};

    struct Fixture {
        backend: Arc<SimulatedBackend>,
        machine: ReplicationStateMachine,
        endpoint: EndpointId,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(SimulatedBackend::new());
        let endpoint = EndpointId::new("sim");
        let resolver = StaticDriverResolver::new();
        resolver.register(endpoint.clone(), backend.clone());
        let adapter = Arc::new(OperationAdapter::new(Arc::new(resolver), Duration::from_millis(100)));
        let backoff = BackoffPolicy::new(BackoffConfig {
            initial_ms: 10,
            max_ms: 80,
            jitter_ratio: 0.0,
            ..BackoffConfig::default()
        });
        Fixture {
            backend,
            machine: ReplicationStateMachine::new(adapter, backoff, DEFAULT_REFRESH_INTERVAL),
            endpoint,
        }
    }

    fn ctx<'a>(
        intent: &'a ReplicationIntent,
        volume: &'a VolumeId,
        endpoint: &'a EndpointId,
        generation: u64,
    ) -> VolumeContext<'a> {
        VolumeContext {
            intent,
            volume,
            endpoint,
            generation,
            deleting: false,
        }
    }

    async fn converge(
        machine: &ReplicationStateMachine,
        ctx: &VolumeContext<'_>,
        status: &mut ReplicationStatus,
    ) -> StepOutcome {
        for _ in 0..8 {
            match machine.step(ctx, status).await {
                StepOutcome::Progressed => continue,
                other => return other,
            }
        }
        StepOutcome::Progressed
    }

    #[tokio::test]
    async fn test_enable_then_promote() {
        let f = fixture();
        let intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Primary);
        let vol = VolumeId::new("v1");
        let c = ctx(&intent, &vol, &f.endpoint, 1);
        let mut status = ReplicationStatus::default();

        assert_eq!(converge(&f.machine, &c, &mut status).await, StepOutcome::Converged);
        assert_eq!(status.current_role, ReplicationRole::Primary);
        assert_eq!(status.state, VolumeState::Primary);
        assert_eq!(status.last_operation.as_ref().unwrap().kind, OperationKind::Promote);
        let effects = f.backend.side_effects(&vol).await;
        assert_eq!((effects.enables, effects.promotions), (1, 1));
    }

    #[tokio::test]
    async fn test_converged_volume_issues_nothing() {
        let f = fixture();
        let intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Secondary);
        let vol = VolumeId::new("v1");
        let c = ctx(&intent, &vol, &f.endpoint, 1);
        let mut status = ReplicationStatus::default();
        converge(&f.machine, &c, &mut status).await;
        let calls = f.backend.call_count().await;

        assert_eq!(f.machine.step(&c, &mut status).await, StepOutcome::Converged);
        assert_eq!(f.backend.call_count().await, calls);
    }

    #[tokio::test]
    async fn test_plan_marks_pending_and_reuses_token() {
        let f = fixture();
        let intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Secondary);
        let vol = VolumeId::new("v1");
        let c = ctx(&intent, &vol, &f.endpoint, 1);
        let mut status = ReplicationStatus::default();
        let now = Utc::now();

        let first = match f.machine.plan(&c, &mut status, now) {
            Plan::Execute(request) => request,
            other => panic!("expected execute, got {:?}", other),
        };
        assert_eq!(first.kind, OperationKind::Enable);
        assert_eq!(status.state, VolumeState::Enabling);
        assert_eq!(status.pending.as_ref().unwrap().token, first.token);

        // simulated crash before the result was applied
        let second = match f.machine.plan(&c, &mut status, now) {
            Plan::Execute(request) => request,
            other => panic!("expected execute, got {:?}", other),
        };
        assert_eq!(second.token, first.token);
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off_then_resets() {
        let f = fixture();
        let intent = ReplicationIntent::for_volume("i1", "v2", DesiredRole::Secondary);
        let vol = VolumeId::new("v2");
        let c = ctx(&intent, &vol, &f.endpoint, 1);
        let mut status = ReplicationStatus::default();
        f.backend.inject(&vol, Fault::Hang, 2).await;

        assert_eq!(
            f.machine.step(&c, &mut status).await,
            StepOutcome::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.state, VolumeState::Enabling);
        let token = status.pending.as_ref().unwrap().token.clone();

        let calls = f.backend.call_count().await;
        let failed_at = status.last_error.as_ref().unwrap().at;
        assert!(matches!(
            f.machine.plan(&c, &mut status, failed_at),
            Plan::Done(StepOutcome::RetryAfter(_))
        ));
        assert_eq!(f.backend.call_count().await, calls);

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(
            f.machine.step(&c, &mut status).await,
            StepOutcome::RetryAfter(Duration::from_millis(20))
        );
        assert_eq!(status.retry_count, 2);
        assert_eq!(status.pending.as_ref().unwrap().token, token);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(f.machine.step(&c, &mut status).await, StepOutcome::Progressed);
        assert_eq!(status.retry_count, 0);
        assert!(status.last_error.is_none());
        assert_eq!(status.last_operation.as_ref().unwrap().token, token);
    }

    #[tokio::test]
    async fn test_terminal_failure_blocks_until_nonce_changes() {
        let f = fixture();
        let mut intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Primary);
        let vol = VolumeId::new("v1");
        let mut status = ReplicationStatus::default();
        {
            let c = ctx(&intent, &vol, &f.endpoint, 1);
            f.machine.step(&c, &mut status).await;
        }
        f.backend.set_peer_reachable(&vol, false).await;
        {
            let c = ctx(&intent, &vol, &f.endpoint, 1);
            assert_eq!(f.machine.step(&c, &mut status).await, StepOutcome::Blocked);
            let error = status.last_error.clone().unwrap();
            assert_eq!(error.kind, ErrorKind::UnsafeOperation);
            assert!(error.terminal);

            let calls = f.backend.call_count().await;
            assert_eq!(f.machine.step(&c, &mut status).await, StepOutcome::Blocked);
            assert_eq!(f.backend.call_count().await, calls);
        }

        f.backend.set_peer_reachable(&vol, true).await;
        intent.retry_nonce = 1;
        let c = ctx(&intent, &vol, &f.endpoint, 1);
        assert_eq!(f.machine.step(&c, &mut status).await, StepOutcome::Progressed);
        assert_eq!(status.current_role, ReplicationRole::Primary);
        assert!(status.blocked.is_none());
    }

    #[tokio::test]
    async fn test_forced_promotion_recorded() {
        let f = fixture();
        let mut intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Primary);
        intent.force = true;
        let vol = VolumeId::new("v1");
        let c = ctx(&intent, &vol, &f.endpoint, 1);
        let mut status = ReplicationStatus::default();
        f.machine.step(&c, &mut status).await;
        f.backend.set_data_state(&vol, DataState::Diverged).await;

        assert_eq!(f.machine.step(&c, &mut status).await, StepOutcome::Progressed);
        let last = status.last_operation.clone().unwrap();
        assert_eq!(last.kind, OperationKind::Promote);
        assert!(last.forced);
    }

    #[tokio::test]
    async fn test_resync_once_per_generation() {
        let f = fixture();
        let mut intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Secondary);
        intent.resync = true;
        let vol = VolumeId::new("v1");
        let c = ctx(&intent, &vol, &f.endpoint, 3);
        let mut status = ReplicationStatus::default();

        assert_eq!(converge(&f.machine, &c, &mut status).await, StepOutcome::Converged);
        assert_eq!(status.resync_generation, Some(3));
        assert_eq!(f.backend.side_effects(&vol).await.resyncs, 1);
        converge(&f.machine, &c, &mut status).await;
        assert_eq!(f.backend.side_effects(&vol).await.resyncs, 1);
    }

    #[tokio::test]
    async fn test_deletion_disables_then_finalizes() {
        let f = fixture();
        let intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Primary);
        let vol = VolumeId::new("v1");
        let mut status = ReplicationStatus::default();
        converge(&f.machine, &ctx(&intent, &vol, &f.endpoint, 1), &mut status).await;

        let deleting = VolumeContext {
            deleting: true,
            ..ctx(&intent, &vol, &f.endpoint, 1)
        };
        assert_eq!(converge(&f.machine, &deleting, &mut status).await, StepOutcome::Finalized);
        assert_eq!(status.current_role, ReplicationRole::Disabled);
        assert_eq!(f.backend.side_effects(&vol).await.disables, 1);
    }

    #[tokio::test]
    async fn test_busy_uses_extended_backoff() {
        let f = fixture();
        let intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Secondary);
        let vol = VolumeId::new("v1");
        let c = ctx(&intent, &vol, &f.endpoint, 1);
        let mut status = ReplicationStatus::default();
        f.backend
            .inject(
                &vol,
                Fault::Error(RemoteError::new(RemoteErrorCode::Busy, "busy")),
                1,
            )
            .await;

        let expected = f.machine.backoff().delay(1, BackoffHint::Extended);
        assert_eq!(f.machine.step(&c, &mut status).await, StepOutcome::RetryAfter(expected));
        assert_eq!(status.last_error.unwrap().kind, ErrorKind::BackendBusy);
    }

    #[tokio::test]
    async fn test_generation_change_resets_backoff() {
        let f = fixture();
        let intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Secondary);
        let vol = VolumeId::new("v1");
        let mut status = ReplicationStatus {
            generation: 1,
            retry_count: 4,
            next_eligible_at: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        };
        let plan = f.machine.plan(&ctx(&intent, &vol, &f.endpoint, 2), &mut status, Utc::now());
        assert!(matches!(plan, Plan::Execute(_)));
        assert_eq!(status.retry_count, 0);
    }

    #[tokio::test]
    async fn test_stale_observation_refreshes_and_adopts_drift() {
        let f = fixture();
        let intent = ReplicationIntent::for_volume("i1", "v1", DesiredRole::Secondary);
        let vol = VolumeId::new("v1");
        let c = ctx(&intent, &vol, &f.endpoint, 1);
        let mut status = ReplicationStatus::default();
        converge(&f.machine, &c, &mut status).await;

        // promoted behind the controller's back
        let external = OperationRequest::new(OperationKind::Promote, vol.clone());
        crate::driver::dispatch(f.backend.as_ref(), &external).await.unwrap();
        status.observed_at = Some(Utc::now() - chrono::Duration::hours(1));

        assert_eq!(
            f.machine.next_operation(&c, &status, Utc::now()),
            Some(OperationKind::GetInfo)
        );
        assert_eq!(f.machine.step(&c, &mut status).await, StepOutcome::Progressed);
        assert_eq!(status.current_role, ReplicationRole::Primary);
        assert_eq!(converge(&f.machine, &c, &mut status).await, StepOutcome::Converged);
        assert_eq!(status.current_role, ReplicationRole::Secondary);
        assert_eq!(f.backend.side_effects(&vol).await.demotions, 1);
    }
}

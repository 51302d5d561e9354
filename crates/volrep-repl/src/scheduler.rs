//! Reconciliation scheduler.
//!
//! A fixed pool of worker tasks pulls intent names from a coalescing queue, so each
//! intent has at most one pass running while distinct intents proceed in parallel. A
//! watch task feeds the queue from store events and cancels a running pass whose intent
//! changed or is being deleted. A pass steps every member volume through the state
//! machine, persisting status before each batch of remote calls and after each result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use volrep_transport::{ChannelRegistry, Connector, EndpointId};

use crate::config::ControllerConfig;
use crate::endpoint::EndpointResolver;
use crate::error::Result;
use crate::events::{EventBus, EventKind};
use crate::group;
use crate::machine::{Plan, ReplicationStateMachine, StepOutcome, VolumeContext};
use crate::operation::{ErrorKind, OperationKind, OperationRequest, OperationResult};
use crate::serializer::{ReconcileQueue, ReconcileTrigger};
use crate::status::{GroupHealth, LastError, ReplicationStatus, ResourceStatus, TerminalBlock};
use crate::store::{IntentStore, StoreError, WatchEvent, WatchEventKind, REPLICATION_FINALIZER};
use crate::types::{ReplicationIntent, VolumeId};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Worker tasks.
    pub workers: usize,
    /// Attempts per status patch under version conflicts.
    pub status_patch_attempts: u32,
    /// Operations per volume per pass.
    pub max_steps_per_pass: u32,
    /// Requeue period for converged intents.
    pub refresh_interval: Duration,
    /// Requeue delay after a pass failed on a store error.
    pub error_requeue: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            status_patch_attempts: 5,
            max_steps_per_pass: 8,
            refresh_interval: Duration::from_secs(300),
            error_requeue: Duration::from_secs(1),
        }
    }
}

impl From<&ControllerConfig> for ControllerOptions {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            workers: config.workers,
            status_patch_attempts: config.status_patch_attempts,
            max_steps_per_pass: config.max_steps_per_pass,
            refresh_interval: config.refresh_interval(),
            error_requeue: Duration::from_millis(config.backoff.initial_ms),
        }
    }
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Run again after the delay.
    Requeue(Duration),
    /// Nothing to do until the intent changes.
    Idle,
    /// Superseded by an intent change or deletion.
    Cancelled,
}

struct PassState {
    intent: ReplicationIntent,
    generation: u64,
    deleting: bool,
    version: u64,
    status: ResourceStatus,
    persisted: ResourceStatus,
}

/// The reconciliation controller.
pub struct Controller {
    store: Arc<dyn IntentStore>,
    machine: Arc<ReplicationStateMachine>,
    endpoints: Arc<dyn EndpointResolver>,
    events: Arc<EventBus>,
    queue: Arc<ReconcileQueue<String>>,
    passes: DashMap<String, CancellationToken>,
    options: ControllerOptions,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates a controller.
    pub fn new(
        store: Arc<dyn IntentStore>,
        machine: Arc<ReplicationStateMachine>,
        endpoints: Arc<dyn EndpointResolver>,
        events: Arc<EventBus>,
        options: ControllerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            machine,
            endpoints,
            events,
            queue: Arc::new(ReconcileQueue::new()),
            passes: DashMap::new(),
            options,
            shutdown: CancellationToken::new(),
        })
    }

    /// The event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The state machine.
    pub fn machine(&self) -> &Arc<ReplicationStateMachine> {
        &self.machine
    }

    /// Requests a pass over `name`.
    pub fn enqueue(&self, name: &str) {
        self.queue.enqueue(name.to_string(), ReconcileTrigger::Requeue);
    }

    /// Stops the workers; running passes are cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Runs until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let events = self.store.watch();
        self.enqueue_all(ReconcileTrigger::Startup).await?;

        let workers: Vec<JoinHandle<()>> = (0..self.options.workers.max(1))
            .map(|id| {
                let controller = Arc::clone(&self);
                tokio::spawn(async move { controller.worker(id).await })
            })
            .collect();
        let watcher = tokio::spawn(Arc::clone(&self).watch_loop(events));
        info!(workers = workers.len(), "controller started");

        self.shutdown.cancelled().await;
        self.queue.shutdown();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task failed");
            }
        }
        let _ = watcher.await;
        info!("controller stopped");
        Ok(())
    }

    async fn enqueue_all(&self, trigger: ReconcileTrigger) -> Result<()> {
        let intents = self.store.list().await?;
        debug!(count = intents.len(), ?trigger, "enqueueing all intents");
        for stored in intents {
            self.queue.enqueue(stored.meta.name, trigger);
        }
        Ok(())
    }

    async fn worker(&self, id: usize) {
        debug!(worker = id, "worker started");
        while let Some((name, trigger)) = self.queue.next().await {
            self.process(&name, trigger).await;
            self.queue.done(&name);
        }
        debug!(worker = id, "worker stopped");
    }

    async fn watch_loop(self: Arc<Self>, mut events: tokio::sync::broadcast::Receiver<WatchEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    debug!(intent = %event.name, kind = ?event.kind, generation = event.generation, "intent event");
                    let trigger = match event.kind {
                        WatchEventKind::Added | WatchEventKind::Modified => {
                            ReconcileTrigger::IntentChanged
                        }
                        WatchEventKind::Deleted => ReconcileTrigger::IntentDeleted,
                    };
                    if event.kind != WatchEventKind::Added {
                        if let Some(pass) = self.passes.get(&event.name) {
                            info!(intent = %event.name, "cancelling superseded reconcile");
                            pass.cancel();
                        }
                    }
                    self.queue.enqueue(event.name, trigger);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "intent watch lagged, relisting");
                    if let Err(e) = self.enqueue_all(ReconcileTrigger::Requeue).await {
                        error!(error = %e, "relist failed");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn process(&self, name: &str, trigger: ReconcileTrigger) {
        let cancel = self.shutdown.child_token();
        self.passes.insert(name.to_string(), cancel.clone());
        let outcome = self.reconcile(name, &cancel).await;
        self.passes.remove(name);

        match outcome {
            Ok(PassOutcome::Requeue(delay)) if delay.is_zero() => {
                self.queue.enqueue(name.to_string(), ReconcileTrigger::Requeue);
            }
            Ok(PassOutcome::Requeue(delay)) => {
                debug!(intent = name, ?trigger, delay_ms = delay.as_millis() as u64, "requeue scheduled");
                self.queue
                    .enqueue_after(name.to_string(), ReconcileTrigger::Requeue, delay);
            }
            Ok(PassOutcome::Idle) | Ok(PassOutcome::Cancelled) => {}
            Err(e) => {
                warn!(intent = name, error = %e, "reconcile pass failed");
                self.queue.enqueue_after(
                    name.to_string(),
                    ReconcileTrigger::Requeue,
                    self.options.error_requeue,
                );
            }
        }
    }

    /// Runs one pass over the intent `name`.
    pub async fn reconcile(&self, name: &str, cancel: &CancellationToken) -> Result<PassOutcome> {
        let mut stored = match self.store.get(name).await {
            Ok(stored) => stored,
            Err(StoreError::NotFound { .. }) => {
                debug!(intent = name, "intent gone");
                return Ok(PassOutcome::Idle);
            }
            Err(e) => return Err(e.into()),
        };
        let deleting = stored.meta.deletion_requested;
        let holds_finalizer = stored.meta.finalizers.contains(REPLICATION_FINALIZER);
        if deleting && !holds_finalizer {
            return Ok(PassOutcome::Idle);
        }
        if !holds_finalizer {
            self.store.add_finalizer(name, REPLICATION_FINALIZER).await?;
            stored = self.store.get(name).await?;
        }

        let persisted = stored.status.unwrap_or_default();
        let mut pass = PassState {
            intent: stored.intent,
            generation: stored.meta.generation,
            deleting,
            version: stored.meta.resource_version,
            status: persisted.clone(),
            persisted,
        };

        if !deleting {
            if let Err(e) = pass.intent.validate() {
                return self.reject_intent(name, &mut pass, e.to_string()).await;
            }
        }
        pass.status.invalid = None;

        let started = group::mark_departing(&pass.intent, &mut pass.status);
        if !started.is_empty() {
            info!(intent = name, departing = ?started, "members no longer declared, disabling");
        }

        // Declared volumes first, then departing ones on the endpoint they last used.
        let leaving: Vec<(VolumeId, Option<EndpointId>, bool)> = pass
            .status
            .members
            .iter()
            .filter(|(_, member)| member.departing)
            .map(|(volume, member)| (volume.clone(), member.endpoint.clone(), true))
            .collect();
        let declared = pass
            .intent
            .target
            .volumes()
            .into_iter()
            .map(|volume| (volume, None, false));

        let mut settled: BTreeMap<VolumeId, StepOutcome> = BTreeMap::new();
        let mut members: Vec<(VolumeId, Option<EndpointId>, bool)> = Vec::new();
        for (volume, recorded, departing) in declared.chain(leaving) {
            let resolved = match recorded {
                Some(endpoint) => Ok(endpoint),
                None => self.endpoints.resolve(&pass.intent, &volume),
            };
            match resolved {
                Ok(endpoint) => members.push((volume, Some(endpoint), departing)),
                Err(e) => {
                    let block = block_for(&pass, departing);
                    let member = pass.status.members.entry(volume.clone()).or_default();
                    record_terminal(member, ErrorKind::Validation, e.to_string(), block);
                    settled.insert(volume.clone(), StepOutcome::Blocked);
                    members.push((volume, None, departing));
                }
            }
        }

        for _ in 0..self.options.max_steps_per_pass.max(1) {
            let now = Utc::now();
            let mut batch: Vec<(&VolumeId, &EndpointId, bool, OperationRequest)> = Vec::new();
            for (volume, endpoint, departing) in &members {
                let Some(endpoint) = endpoint else { continue };
                if settled.contains_key(volume) {
                    continue;
                }
                let ctx = VolumeContext {
                    intent: &pass.intent,
                    volume,
                    endpoint,
                    generation: pass.generation,
                    deleting: deleting || *departing,
                };
                let member = pass.status.members.entry(volume.clone()).or_default();
                match self.machine.plan(&ctx, member, now) {
                    Plan::Execute(request) => batch.push((volume, endpoint, *departing, request)),
                    Plan::Done(outcome) => {
                        if *departing && outcome == StepOutcome::Finalized {
                            pass.status.members.remove(volume);
                            info!(intent = name, volume = %volume, "departed member disabled");
                            self.events.publish(name, Some(volume), EventKind::MemberReleased);
                        }
                        settled.insert(volume.clone(), outcome);
                    }
                }
            }
            if batch.is_empty() {
                break;
            }

            self.persist(name, &mut pass).await?;

            let calls = batch
                .iter()
                .map(|(_, endpoint, _, request)| self.machine.adapter().execute(endpoint, request));
            let results = tokio::select! {
                results = join_all(calls) => results,
                _ = cancel.cancelled() => {
                    info!(intent = name, in_flight = batch.len(), "reconcile pass cancelled");
                    return Ok(PassOutcome::Cancelled);
                }
            };

            let now = Utc::now();
            for ((volume, endpoint, departing, request), result) in batch.iter().zip(results) {
                let ctx = VolumeContext {
                    intent: &pass.intent,
                    volume,
                    endpoint,
                    generation: pass.generation,
                    deleting: deleting || *departing,
                };
                let member = pass.status.members.entry((*volume).clone()).or_default();
                let outcome = self.machine.apply(&ctx, request, &result, member, now);
                self.publish_result(name, volume, request, &result, outcome, member);
                if outcome != StepOutcome::Progressed {
                    settled.insert((*volume).clone(), outcome);
                }
            }
            self.persist(name, &mut pass).await?;
        }
        self.persist(name, &mut pass).await?;

        let outcomes: Vec<StepOutcome> = members
            .iter()
            .map(|(volume, _, _)| {
                settled
                    .get(volume)
                    .copied()
                    .unwrap_or(StepOutcome::Progressed)
            })
            .collect();

        if deleting && outcomes.iter().all(|o| *o == StepOutcome::Finalized) {
            self.store.remove_finalizer(name, REPLICATION_FINALIZER).await?;
            self.events.publish(name, None, EventKind::Finalized);
            return Ok(PassOutcome::Idle);
        }
        Ok(self.next_pass(&outcomes, deleting))
    }

    fn next_pass(&self, outcomes: &[StepOutcome], deleting: bool) -> PassOutcome {
        if outcomes.iter().any(|o| *o == StepOutcome::Progressed) {
            return PassOutcome::Requeue(Duration::ZERO);
        }
        let retry = outcomes
            .iter()
            .filter_map(|o| match o {
                StepOutcome::RetryAfter(delay) => Some(*delay),
                _ => None,
            })
            .min();
        if let Some(delay) = retry {
            return PassOutcome::Requeue(delay);
        }
        let waiting = outcomes
            .iter()
            .all(|o| matches!(o, StepOutcome::Blocked | StepOutcome::Finalized));
        if deleting || waiting {
            PassOutcome::Idle
        } else {
            PassOutcome::Requeue(self.options.refresh_interval)
        }
    }

    async fn reject_intent(&self, name: &str, pass: &mut PassState, message: String) -> Result<PassOutcome> {
        warn!(intent = name, error = %message, "intent rejected");
        let block = block_for(pass, false);
        for volume in pass.intent.target.volumes() {
            if volume.as_str().is_empty() {
                continue;
            }
            let member = pass.status.members.entry(volume).or_default();
            record_terminal(member, ErrorKind::Validation, message.clone(), block);
        }
        let newly_invalid = pass.status.invalid.as_deref() != Some(message.as_str());
        pass.status.invalid = Some(message.clone());
        self.persist(name, pass).await?;
        if newly_invalid {
            self.events.publish(
                name,
                None,
                EventKind::OperationFailed {
                    operation: OperationKind::Enable,
                    kind: ErrorKind::Validation,
                    terminal: true,
                    message,
                },
            );
        }
        Ok(PassOutcome::Idle)
    }

    async fn persist(&self, name: &str, pass: &mut PassState) -> Result<()> {
        group::aggregate(&pass.intent, pass.generation, &mut pass.status);
        if pass.status.invalid.is_some() {
            pass.status.health = GroupHealth::Degraded;
        }
        pass.status.observed_generation = pass.generation;
        if pass.status == pass.persisted {
            return Ok(());
        }

        pass.version = self.patch_status(name, pass.version, &pass.status).await?;

        if pass.intent.target.is_group()
            && pass.status.health == GroupHealth::Degraded
            && pass.persisted.health != GroupHealth::Degraded
        {
            if let Some(failure) = &pass.status.first_failure {
                self.events.publish(
                    name,
                    Some(&failure.volume),
                    EventKind::GroupDegraded {
                        volume: failure.volume.clone(),
                        message: failure.error.message.clone(),
                    },
                );
            }
        }
        pass.persisted = pass.status.clone();
        Ok(())
    }

    /// Writes status, re-reading only the resource version on conflict.
    async fn patch_status(&self, name: &str, version: u64, status: &ResourceStatus) -> Result<u64> {
        let attempts = self.options.status_patch_attempts.max(1);
        let mut expected = version;
        let mut attempt = 1;
        loop {
            match self.store.patch_status(name, expected, status.clone()).await {
                Ok(next) => return Ok(next),
                Err(StoreError::Conflict { actual, .. }) if attempt < attempts => {
                    debug!(intent = name, attempt, expected, actual, "status patch conflict, retrying");
                    expected = self.store.get(name).await?.meta.resource_version;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn publish_result(
        &self,
        name: &str,
        volume: &VolumeId,
        request: &OperationRequest,
        result: &OperationResult,
        outcome: StepOutcome,
        member: &ReplicationStatus,
    ) {
        match result {
            OperationResult::Success(reply) => {
                if request.kind.is_mutating() {
                    self.events.publish(
                        name,
                        Some(volume),
                        EventKind::OperationSucceeded {
                            operation: request.kind,
                            forced: reply.forced,
                            no_op: reply.no_op,
                        },
                    );
                }
            }
            OperationResult::RetryableFailure { reason, .. } => {
                self.events.publish(
                    name,
                    Some(volume),
                    EventKind::OperationFailed {
                        operation: request.kind,
                        kind: reason.kind,
                        terminal: false,
                        message: reason.message.clone(),
                    },
                );
                if let StepOutcome::RetryAfter(delay) = outcome {
                    self.events.publish(
                        name,
                        Some(volume),
                        EventKind::RetryScheduled {
                            retry_count: member.retry_count,
                            delay_ms: delay.as_millis() as u64,
                        },
                    );
                }
            }
            OperationResult::TerminalFailure(reason) => {
                self.events.publish(
                    name,
                    Some(volume),
                    EventKind::OperationFailed {
                        operation: request.kind,
                        kind: reason.kind,
                        terminal: true,
                        message: reason.message.clone(),
                    },
                );
            }
        }
    }
}

fn block_for(pass: &PassState, departing: bool) -> TerminalBlock {
    TerminalBlock {
        generation: pass.generation,
        retry_nonce: pass.intent.retry_nonce,
        deleting: pass.deleting || departing,
    }
}

fn record_terminal(member: &mut ReplicationStatus, kind: ErrorKind, message: String, block: TerminalBlock) {
    if member.blocked == Some(block) {
        return;
    }
    member.last_error = Some(LastError {
        operation: member
            .pending
            .as_ref()
            .map(|p| p.kind)
            .unwrap_or(OperationKind::Enable),
        kind,
        message,
        terminal: true,
        at: Utc::now(),
    });
    member.blocked = Some(block);
    member.pending = None;
}

/// Periodically evicts idle or unhealthy channels until `cancel` fires.
pub fn spawn_eviction<K>(
    registry: Arc<ChannelRegistry<K>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    K: Connector + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = registry.evict_expired();
                    if evicted > 0 {
                        info!(evicted, "evicted idle channels");
                    }
                }
            }
        }
    })
}

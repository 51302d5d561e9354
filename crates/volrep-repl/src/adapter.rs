//! Operation adapter: issues one classified operation against one volume.
//!
//! Every call validates locally, takes the volume's lock, resolves the endpoint's driver,
//! runs the operation under a deadline and maps the outcome onto the error taxonomy.
//! It never retries; retry policy belongs to the state machine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use volrep_transport::EndpointId;

use crate::driver::{dispatch, DriverResolver};
use crate::operation::{classify, DriverError, OperationRequest, OperationResult};
use crate::serializer::VolumeLocks;

/// Default per-operation deadline.
pub const DEFAULT_OPERATION_DEADLINE: Duration = Duration::from_secs(30);

/// Slack added to the deadline for the adapter's own timeout, so a remote driver's
/// request deadline always fires first.
const DEADLINE_GRACE: Duration = Duration::from_millis(100);

/// Executes operations against resolved drivers, one at a time per volume.
pub struct OperationAdapter {
    resolver: Arc<dyn DriverResolver>,
    locks: Arc<VolumeLocks>,
    deadline: Duration,
}

impl OperationAdapter {
    /// Creates an adapter with its own lock table.
    pub fn new(resolver: Arc<dyn DriverResolver>, deadline: Duration) -> Self {
        Self::with_locks(resolver, Arc::new(VolumeLocks::new()), deadline)
    }

    /// Creates an adapter sharing an existing lock table.
    pub fn with_locks(
        resolver: Arc<dyn DriverResolver>,
        locks: Arc<VolumeLocks>,
        deadline: Duration,
    ) -> Self {
        Self {
            resolver,
            locks,
            deadline,
        }
    }

    /// The per-volume lock table.
    pub fn locks(&self) -> &Arc<VolumeLocks> {
        &self.locks
    }

    /// The per-operation deadline.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Runs `request` against the driver at `endpoint`.
    pub async fn execute(&self, endpoint: &EndpointId, request: &OperationRequest) -> OperationResult {
        if let Err(e) = request.validate() {
            warn!(volume = %request.volume_id, op = %request.kind, error = %e, "rejected before dispatch");
            return OperationResult::invalid(&e);
        }

        let _guard = self.locks.lock(&request.volume_id).await;
        let started = Instant::now();
        let outcome = match self.resolver.resolve(endpoint).await {
            Ok(driver) => {
                let limit = self.deadline + DEADLINE_GRACE;
                match tokio::time::timeout(limit, dispatch(driver.as_ref(), request)).await {
                    Ok(result) => result,
                    Err(_) => Err(DriverError::DeadlineExceeded(self.deadline.as_millis() as u64)),
                }
            }
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(reply) => {
                info!(
                    volume = %request.volume_id,
                    endpoint = %endpoint,
                    op = %request.kind,
                    token = %request.token,
                    no_op = reply.no_op,
                    forced = reply.forced,
                    elapsed_ms,
                    "operation succeeded"
                );
                OperationResult::Success(reply)
            }
            Err(e) => {
                let result = classify(&e);
                if let Some(reason) = result.failure() {
                    warn!(
                        volume = %request.volume_id,
                        endpoint = %endpoint,
                        op = %request.kind,
                        kind = ?reason.kind,
                        retryable = !matches!(result, OperationResult::TerminalFailure(_)),
                        elapsed_ms,
                        error = %e,
                        "operation failed"
                    );
                }
                debug!(volume = %request.volume_id, "classified failure: {:?}", result);
                result
            }
        }
    }
}

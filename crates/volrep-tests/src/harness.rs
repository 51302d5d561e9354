//! Test harness: a controller wired to an in-memory store and a simulated backend,
//! reached either in-process or through a real TCP sidecar.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use volrep_repl::{
    Controller, ControllerOptions, DriverError, DriverService, EventBus, IntentStore,
    MemoryStore, OperationAdapter, OperationReply, OperationRequest, RemoteDriverResolver,
    ReplicationDriver, ReplicationIntent, ReplicationStateMachine, ReplicationStatus,
    SimulatedBackend, StaticDriverResolver, StaticEndpointResolver, StoredIntent, VolumeId,
};
use volrep_transport::{
    BackoffConfig, BackoffPolicy, ChannelRegistry, EndpointId, RegistryConfig, RpcClientConfig,
    RpcConnector, RpcServer, TcpTransport, TcpTransportConfig,
};

/// Installs a test-friendly subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Serves `backend` on an ephemeral localhost port.
pub async fn start_sidecar(backend: Arc<SimulatedBackend>) -> anyhow::Result<(EndpointId, JoinHandle<()>)> {
    let transport = TcpTransport::new(TcpTransportConfig::default());
    let listener = transport.listen("127.0.0.1:0").await?;
    let endpoint = EndpointId::new(listener.local_addr()?.to_string());
    let handle = tokio::spawn(async move {
        let service = Arc::new(DriverService::new(backend));
        if let Err(e) = RpcServer::serve(&transport, listener, service).await {
            tracing::debug!(error = %e, "test sidecar stopped");
        }
    });
    Ok((endpoint, handle))
}

/// An adapter reaching sidecars through a fresh channel registry.
pub fn remote_adapter(
    deadline: Duration,
) -> (OperationAdapter, Arc<ChannelRegistry<RpcConnector>>) {
    let registry = Arc::new(ChannelRegistry::new(
        RpcConnector::new(TcpTransportConfig::default(), RpcClientConfig::default()),
        RegistryConfig::default(),
    ));
    let resolver = Arc::new(RemoteDriverResolver::new(registry.clone(), deadline));
    (OperationAdapter::new(resolver, deadline), registry)
}

/// Wraps the simulated backend and records how many operations overlap, per volume and
/// in total.
pub struct OverlapDriver {
    inner: Arc<SimulatedBackend>,
    active: Mutex<HashMap<VolumeId, usize>>,
    peaks: Mutex<HashMap<VolumeId, usize>>,
    global_active: AtomicUsize,
    global_peak: AtomicUsize,
}

struct InFlight<'a> {
    tracker: &'a OverlapDriver,
    volume: VolumeId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut active = self.tracker.active.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = active.get_mut(&self.volume) {
            *count -= 1;
        }
        self.tracker.global_active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl OverlapDriver {
    /// Wraps `inner`.
    pub fn new(inner: Arc<SimulatedBackend>) -> Self {
        Self {
            inner,
            active: Mutex::new(HashMap::new()),
            peaks: Mutex::new(HashMap::new()),
            global_active: AtomicUsize::new(0),
            global_peak: AtomicUsize::new(0),
        }
    }

    /// Most operations ever overlapping on `volume`.
    pub fn peak(&self, volume: &VolumeId) -> usize {
        let peaks = self.peaks.lock().unwrap_or_else(|p| p.into_inner());
        peaks.get(volume).copied().unwrap_or(0)
    }

    /// Most operations ever overlapping across all volumes.
    pub fn global_peak(&self) -> usize {
        self.global_peak.load(Ordering::SeqCst)
    }

    fn enter(&self, volume: &VolumeId) -> InFlight<'_> {
        {
            let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
            let count = active.entry(volume.clone()).or_insert(0);
            *count += 1;
            let mut peaks = self.peaks.lock().unwrap_or_else(|p| p.into_inner());
            let peak = peaks.entry(volume.clone()).or_insert(0);
            *peak = (*peak).max(*count);
        }
        let now = self.global_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.global_peak.fetch_max(now, Ordering::SeqCst);
        InFlight {
            tracker: self,
            volume: volume.clone(),
        }
    }

    async fn observe(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        let _in_flight = self.enter(&request.volume_id);
        volrep_repl::dispatch(self.inner.as_ref(), request).await
    }
}

#[async_trait]
impl ReplicationDriver for OverlapDriver {
    async fn enable(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.observe(request).await
    }

    async fn disable(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.observe(request).await
    }

    async fn promote(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.observe(request).await
    }

    async fn demote(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.observe(request).await
    }

    async fn resync(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.observe(request).await
    }

    async fn get_info(&self, request: &OperationRequest) -> Result<OperationReply, DriverError> {
        self.observe(request).await
    }
}

/// How to build a [`TestBed`].
#[derive(Debug, Clone)]
pub struct TestBedOptions {
    /// Per-operation deadline.
    pub deadline: Duration,
    /// Retry schedule.
    pub backoff: BackoffConfig,
    /// Reach the backend through a TCP sidecar instead of in-process.
    pub over_tcp: bool,
    /// Controller worker tasks.
    pub workers: usize,
    /// Start the controller's workers; otherwise tests drive passes by hand.
    pub autostart: bool,
}

impl Default for TestBedOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(200),
            backoff: BackoffConfig {
                initial_ms: 20,
                max_ms: 200,
                jitter_ratio: 0.0,
                ..BackoffConfig::default()
            },
            over_tcp: false,
            workers: 4,
            autostart: true,
        }
    }
}

/// A running controller plus handles to everything around it.
pub struct TestBed {
    /// Intent store.
    pub store: Arc<MemoryStore>,
    /// Simulated backend state.
    pub backend: Arc<SimulatedBackend>,
    /// Overlap tracking; only sees traffic for in-process beds.
    pub overlap: Arc<OverlapDriver>,
    /// The controller.
    pub controller: Arc<Controller>,
    /// Endpoint every volume resolves to.
    pub endpoint: EndpointId,
    /// Channel registry for TCP beds.
    pub registry: Option<Arc<ChannelRegistry<RpcConnector>>>,
    running: Option<JoinHandle<volrep_repl::Result<()>>>,
    sidecar: Option<JoinHandle<()>>,
}

impl TestBed {
    /// Builds the bed and starts the controller.
    pub async fn start(options: TestBedOptions) -> anyhow::Result<Self> {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(SimulatedBackend::new());
        let overlap = Arc::new(OverlapDriver::new(backend.clone()));

        let (adapter, endpoint, registry, sidecar) = if options.over_tcp {
            let (endpoint, sidecar) = start_sidecar(backend.clone()).await?;
            let (adapter, registry) = remote_adapter(options.deadline);
            (adapter, endpoint, Some(registry), Some(sidecar))
        } else {
            let endpoint = EndpointId::new("in-process");
            let resolver = StaticDriverResolver::new();
            resolver.register(endpoint.clone(), overlap.clone());
            let adapter = OperationAdapter::new(Arc::new(resolver), options.deadline);
            (adapter, endpoint, None, None)
        };

        let machine = Arc::new(ReplicationStateMachine::new(
            Arc::new(adapter),
            BackoffPolicy::new(options.backoff.clone()),
            Duration::from_secs(300),
        ));
        let controller = Controller::new(
            store.clone(),
            machine,
            Arc::new(StaticEndpointResolver::single(endpoint.clone())),
            Arc::new(EventBus::default()),
            ControllerOptions {
                workers: options.workers,
                error_requeue: Duration::from_millis(options.backoff.initial_ms),
                ..ControllerOptions::default()
            },
        );
        let running = options
            .autostart
            .then(|| tokio::spawn(controller.clone().run()));

        Ok(Self {
            store,
            backend,
            overlap,
            controller,
            endpoint,
            registry,
            running,
            sidecar,
        })
    }

    /// Creates or updates an intent.
    pub async fn apply(&self, intent: ReplicationIntent) -> anyhow::Result<StoredIntent> {
        Ok(self.store.apply(intent).await?)
    }

    /// Current status of one member volume.
    pub async fn member(&self, name: &str, volume: &VolumeId) -> Option<ReplicationStatus> {
        let stored = self.store.get(name).await.ok()?;
        stored.status?.members.get(volume).cloned()
    }

    /// Polls the store until `pred` holds for the resource (`None` once it is gone).
    pub async fn wait_for<F>(&self, name: &str, timeout: Duration, pred: F) -> anyhow::Result<Option<StoredIntent>>
    where
        F: Fn(Option<&StoredIntent>) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.store.get(name).await.ok();
            if pred(current.as_ref()) {
                return Ok(current);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("condition on {} not reached within {:?}: {:?}", name, timeout, current);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until `pred` holds for one member's status.
    pub async fn wait_for_member<F>(
        &self,
        name: &str,
        volume: &VolumeId,
        timeout: Duration,
        pred: F,
    ) -> anyhow::Result<ReplicationStatus>
    where
        F: Fn(&ReplicationStatus) -> bool,
    {
        let stored = self
            .wait_for(name, timeout, |stored| {
                stored
                    .and_then(|s| s.status.as_ref())
                    .and_then(|s| s.members.get(volume))
                    .is_some_and(|status| pred(status))
            })
            .await?;
        stored
            .and_then(|s| s.status)
            .and_then(|s| s.members.get(volume).cloned())
            .ok_or_else(|| anyhow::anyhow!("{} disappeared from {}", volume, name))
    }

    /// Stops the controller and the sidecar.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.controller.shutdown();
        if let Some(running) = self.running.take() {
            running.await??;
        }
        if let Some(sidecar) = self.sidecar.take() {
            sidecar.abort();
        }
        Ok(())
    }
}

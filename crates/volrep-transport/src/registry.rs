//! Channel registry: one reusable RPC channel per sidecar endpoint.
//!
//! Channels are created lazily on the first `acquire` for an endpoint. Concurrent
//! acquirers for the same endpoint queue on a per-endpoint slot, so only one of them
//! dials while the rest share its outcome, failures included. Health is advisory: an
//! entry marked unhealthy is replaced on the next acquire, never checked in the
//! background.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::rpc::{RpcClient, RpcClientConfig};
use crate::tcp::{TcpTransport, TcpTransportConfig};

/// Address of a storage-driver sidecar (node or driver instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Wraps an endpoint address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Establishes channels to endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Channel handle produced by this connector. Must support concurrent calls.
    type Channel: Send + Sync + 'static;

    /// Dials `endpoint`.
    async fn connect(&self, endpoint: &EndpointId) -> Result<Self::Channel>;

    /// True if the channel is known to be unusable without a reconnect.
    fn is_closed(&self, _channel: &Self::Channel) -> bool {
        false
    }
}

/// Connector producing multiplexed [`RpcClient`] channels over TCP.
#[derive(Debug, Clone)]
pub struct RpcConnector {
    transport: TcpTransport,
    rpc: RpcClientConfig,
}

impl RpcConnector {
    /// Creates a connector with the given TCP and RPC settings.
    pub fn new(tcp: TcpTransportConfig, rpc: RpcClientConfig) -> Self {
        Self {
            transport: TcpTransport::new(tcp),
            rpc,
        }
    }
}

#[async_trait]
impl Connector for RpcConnector {
    type Channel = RpcClient;

    async fn connect(&self, endpoint: &EndpointId) -> Result<RpcClient> {
        let conn = self.transport.connect(endpoint.as_str()).await?;
        Ok(RpcClient::new(Arc::new(conn), self.rpc.clone()))
    }

    fn is_closed(&self, channel: &RpcClient) -> bool {
        channel.is_closed()
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound on channel establishment (default: 5s).
    pub connect_timeout: Duration,
    /// Entries unused for this long are evicted by `evict_idle` (default: 10min).
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// A pooled channel shared by every operation targeting the same endpoint.
pub struct ChannelEntry<C> {
    endpoint: EndpointId,
    channel: C,
    healthy: AtomicBool,
    refs: AtomicUsize,
    epoch: Instant,
    last_used_ms: AtomicU64,
}

impl<C> ChannelEntry<C> {
    fn new(endpoint: EndpointId, channel: C) -> Self {
        Self {
            endpoint,
            channel,
            healthy: AtomicBool::new(true),
            refs: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_used_ms: AtomicU64::new(0),
        }
    }

    /// Endpoint this channel talks to.
    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// The channel handle.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Advisory health flag.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Flags the channel after a connection-level failure.
    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// Number of outstanding leases.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Time since the entry was last leased or released.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_used_ms.load(Ordering::SeqCst));
        self.epoch.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_used_ms.store(now, Ordering::SeqCst);
    }

    fn lease(self: &Arc<Self>) -> ChannelLease<C> {
        self.refs.fetch_add(1, Ordering::SeqCst);
        self.touch();
        ChannelLease {
            entry: Arc::clone(self),
        }
    }
}

/// A counted reference to a [`ChannelEntry`]; the entry is not evicted while leased.
pub struct ChannelLease<C> {
    entry: Arc<ChannelEntry<C>>,
}

impl<C> ChannelLease<C> {
    /// The leased entry.
    pub fn entry(&self) -> &ChannelEntry<C> {
        &self.entry
    }

    /// The channel handle.
    pub fn channel(&self) -> &C {
        &self.entry.channel
    }

    /// Flags the underlying entry as unhealthy.
    pub fn mark_unhealthy(&self) {
        self.entry.mark_unhealthy();
    }
}

impl<C> Drop for ChannelLease<C> {
    fn drop(&mut self) {
        self.entry.touch();
        self.entry.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Endpoints currently holding a live entry.
    pub endpoints: usize,
    /// Channels established.
    pub created: u64,
    /// Acquires served by an existing entry.
    pub reused: u64,
    /// Entries removed by eviction.
    pub evicted: u64,
    /// Failed channel establishments.
    pub connect_failures: u64,
}

/// Per-endpoint state guarded by the slot lock.
struct SlotState<C> {
    entry: Option<Arc<ChannelEntry<C>>>,
    /// Outcome of the most recent failed dial and when it completed.
    failed: Option<(Instant, TransportError)>,
}

impl<C> Default for SlotState<C> {
    fn default() -> Self {
        Self {
            entry: None,
            failed: None,
        }
    }
}

type Slot<C> = Arc<tokio::sync::Mutex<SlotState<C>>>;

/// Owns, reuses and evicts channels keyed by endpoint identity.
pub struct ChannelRegistry<K: Connector> {
    connector: K,
    config: RegistryConfig,
    slots: Mutex<HashMap<EndpointId, Slot<K::Channel>>>,
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    connect_failures: AtomicU64,
}

impl<K: Connector> ChannelRegistry<K> {
    /// Creates an empty registry.
    pub fn new(connector: K, config: RegistryConfig) -> Self {
        Self {
            connector,
            config,
            slots: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<EndpointId, Slot<K::Channel>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a lease on the healthy entry for `endpoint`, establishing one if needed.
    ///
    /// Establishment is bounded by the connect timeout and fails with
    /// [`TransportError::ConnectionTimeout`] when exceeded. Callers that queued behind a
    /// dial which then failed receive that dial's error instead of dialing again, and
    /// waiting for the slot is bounded by the same timeout.
    pub async fn acquire(&self, endpoint: &EndpointId) -> Result<ChannelLease<K::Channel>> {
        let slot = {
            let mut slots = self.lock_slots();
            slots.entry(endpoint.clone()).or_default().clone()
        };

        let timeout = self.config.connect_timeout;
        let arrived = Instant::now();
        let mut guard = match tokio::time::timeout(timeout, slot.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                debug!(endpoint = %endpoint, "gave up waiting for in-progress dial");
                return Err(self.timeout_error(endpoint));
            }
        };
        if let Some(entry) = guard.entry.as_ref() {
            if entry.is_healthy() && !self.connector.is_closed(&entry.channel) {
                self.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.lease());
            }
            debug!(endpoint = %endpoint, "re-establishing unhealthy channel");
        }
        if let Some((failed_at, error)) = guard.failed.as_ref() {
            if *failed_at > arrived {
                debug!(endpoint = %endpoint, error = %error, "sharing failed dial");
                return Err(error.clone());
            }
        }

        let connected = match tokio::time::timeout(timeout, self.connector.connect(endpoint)).await
        {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(endpoint)),
        };
        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                self.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint = %endpoint, error = %e, "channel establishment failed");
                guard.failed = Some((Instant::now(), e.clone()));
                return Err(e);
            }
        };

        let entry = Arc::new(ChannelEntry::new(endpoint.clone(), channel));
        guard.entry = Some(entry.clone());
        guard.failed = None;
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(endpoint = %endpoint, "channel established");
        Ok(entry.lease())
    }

    fn timeout_error(&self, endpoint: &EndpointId) -> TransportError {
        TransportError::ConnectionTimeout {
            addr: endpoint.to_string(),
            timeout_ms: self.config.connect_timeout.as_millis() as u64,
        }
    }

    /// Flags an entry after a connection-level failure; the next acquire replaces it.
    pub fn mark_unhealthy(&self, entry: &ChannelEntry<K::Channel>) {
        if entry.is_healthy() {
            warn!(endpoint = %entry.endpoint(), "marking channel unhealthy");
        }
        entry.mark_unhealthy();
    }

    /// Removes unleased entries idle for at least `max_idle`, and unleased unhealthy
    /// entries regardless of idle time. Returns the number evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut evicted = 0;
        let mut slots = self.lock_slots();
        slots.retain(|endpoint, slot| {
            let Ok(mut guard) = slot.try_lock() else {
                // An acquire is in progress on this endpoint.
                return true;
            };
            let stale = guard.entry.as_ref().is_some_and(|entry| {
                entry.ref_count() == 0 && (!entry.is_healthy() || entry.idle_for() >= max_idle)
            });
            if stale {
                debug!(endpoint = %endpoint, "evicting channel");
                guard.entry = None;
                evicted += 1;
            }
            guard.entry.is_some() || Arc::strong_count(slot) > 1
        });
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Evicts with the configured idle timeout.
    pub fn evict_expired(&self) -> usize {
        self.evict_idle(self.config.idle_timeout)
    }

    /// Number of endpoints with a live entry.
    pub async fn entry_count(&self) -> usize {
        let slots: Vec<Slot<K::Channel>> = self.lock_slots().values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.entry.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Snapshot of the registry counters.
    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            endpoints: self.entry_count().await,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }

    /// The registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

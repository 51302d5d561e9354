//! Controller configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use volrep_transport::{BackoffConfig, EndpointId, RegistryConfig, RpcClientConfig, TcpTransportConfig};

use crate::types::ReplicationIntent;

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Channel establishment bound in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-operation deadline in milliseconds.
    pub operation_deadline_ms: u64,
    /// Channels unused this long are evicted.
    pub idle_timeout_secs: u64,
    /// How often the eviction task runs.
    pub eviction_interval_secs: u64,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            operation_deadline_ms: 30_000,
            idle_timeout_secs: 600,
            eviction_interval_secs: 60,
            nodelay: true,
        }
    }
}

impl TransportSettings {
    /// Per-operation deadline.
    pub fn operation_deadline(&self) -> Duration {
        Duration::from_millis(self.operation_deadline_ms)
    }

    /// Eviction task period.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }

    /// TCP settings.
    pub fn tcp(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            nodelay: self.nodelay,
        }
    }

    /// RPC client settings; the client timeout backs up the operation deadline.
    pub fn rpc(&self) -> RpcClientConfig {
        RpcClientConfig {
            response_timeout_ms: self.operation_deadline_ms,
        }
    }

    /// Channel registry settings.
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Reconcile worker tasks.
    pub workers: usize,
    /// Transport settings.
    pub transport: TransportSettings,
    /// Retry backoff.
    pub backoff: BackoffConfig,
    /// Period of backend refreshes for converged volumes.
    pub refresh_interval_secs: u64,
    /// Attempts for a status patch that keeps hitting version conflicts.
    pub status_patch_attempts: u32,
    /// Operations one reconcile pass may issue per volume before yielding.
    pub max_steps_per_pass: u32,
    /// Driver name to sidecar address.
    pub endpoints: BTreeMap<String, EndpointId>,
    /// Endpoint used when a class names neither an endpoint nor a known driver.
    pub default_endpoint: Option<EndpointId>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            transport: TransportSettings::default(),
            backoff: BackoffConfig::default(),
            refresh_interval_secs: 300,
            status_patch_attempts: 5,
            max_steps_per_pass: 8,
            endpoints: BTreeMap::new(),
            default_endpoint: None,
        }
    }
}

impl ControllerConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ControllerConfig = parse_by_extension(path, &contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`from_file`](Self::from_file), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Rejects settings the controller cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.transport.operation_deadline_ms == 0 {
            anyhow::bail!("transport.operation_deadline_ms must be positive");
        }
        if self.status_patch_attempts == 0 {
            anyhow::bail!("status_patch_attempts must be at least 1");
        }
        if self.backoff.max_ms < self.backoff.initial_ms {
            anyhow::bail!(
                "backoff.max_ms ({}) is below backoff.initial_ms ({})",
                self.backoff.max_ms,
                self.backoff.initial_ms
            );
        }
        Ok(())
    }

    /// Refresh period.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Deserialize)]
struct IntentFile {
    #[serde(default)]
    intents: Vec<ReplicationIntent>,
}

/// Reads intents to seed the store from a `.toml` or `.json` file with an `intents` list.
pub fn load_intents(path: &Path) -> anyhow::Result<Vec<ReplicationIntent>> {
    let contents = std::fs::read_to_string(path)?;
    let file: IntentFile = parse_by_extension(path, &contents)?;
    for intent in &file.intents {
        intent
            .validate()
            .map_err(|e| anyhow::anyhow!("intent {}: {}", intent.name, e))?;
    }
    Ok(file.intents)
}

fn parse_by_extension<T: serde::de::DeserializeOwned>(path: &Path, contents: &str) -> anyhow::Result<T> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext.to_lowercase().as_str() {
        "toml" => Ok(toml::from_str(contents)?),
        "json" => Ok(serde_json::from_str(contents)?),
        _ => anyhow::bail!("Unsupported config file extension: {}", ext),
    }
}

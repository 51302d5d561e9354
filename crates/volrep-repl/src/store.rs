//! Intent/status store contract and the in-memory implementation.
//!
//! Intents are read through `get`/`list` and observed through a watch stream; status is
//! written back with resource-version guarded patches. A resource carrying finalizers is
//! only marked for deletion by `delete` and disappears once the last one is removed.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::status::ResourceStatus;
use crate::types::ReplicationIntent;

/// Finalizer held while replication may still be enabled for an intent's volumes.
pub const REPLICATION_FINALIZER: &str = "replication.volrep.io/disable";

const WATCH_CAPACITY: usize = 1024;

/// Store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No such resource.
    #[error("intent {name} not found")]
    NotFound {
        /// Resource name.
        name: String,
    },
    /// The resource changed since it was read.
    #[error("resource version conflict on {name}: expected {expected}, found {actual}")]
    Conflict {
        /// Resource name.
        name: String,
        /// Version the caller read.
        expected: u64,
        /// Current version.
        actual: u64,
    },
}

/// Store result alias.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store-managed metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Resource name.
    pub name: String,
    /// Bumped on every intent change.
    pub generation: u64,
    /// Bumped on every write, status included.
    pub resource_version: u64,
    /// Deletion has been requested.
    pub deletion_requested: bool,
    /// Finalizers blocking removal.
    pub finalizers: BTreeSet<String>,
}

/// An intent with its metadata and last written status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIntent {
    /// Metadata.
    pub meta: ResourceMeta,
    /// Declared intent.
    pub intent: ReplicationIntent,
    /// Status written by the controller.
    pub status: Option<ResourceStatus>,
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Newly created.
    Added,
    /// Intent changed or deletion requested.
    Modified,
    /// Removed from the store.
    Deleted,
}

/// A change notification. Status patches are not reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub kind: WatchEventKind,
    /// Resource name.
    pub name: String,
    /// Generation after the change.
    pub generation: u64,
}

/// Watch-and-patch access to intents and status.
#[async_trait]
pub trait IntentStore: Send + Sync {
    /// Reads one resource.
    async fn get(&self, name: &str) -> StoreResult<StoredIntent>;

    /// Reads every resource.
    async fn list(&self) -> StoreResult<Vec<StoredIntent>>;

    /// Subscribes to intent changes.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;

    /// Replaces the status if the resource is still at `expected_version`. Returns the
    /// new resource version.
    async fn patch_status(
        &self,
        name: &str,
        expected_version: u64,
        status: ResourceStatus,
    ) -> StoreResult<u64>;

    /// Adds a finalizer; no-op if present.
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> StoreResult<()>;

    /// Removes a finalizer, completing a requested deletion when none remain.
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> StoreResult<()>;

    /// Creates or updates an intent.
    async fn apply(&self, intent: ReplicationIntent) -> StoreResult<StoredIntent>;

    /// Requests deletion.
    async fn delete(&self, name: &str) -> StoreResult<()>;
}

/// In-memory [`IntentStore`].
pub struct MemoryStore {
    resources: RwLock<BTreeMap<String, StoredIntent>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            resources: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn emit(&self, kind: WatchEventKind, name: &str, generation: u64) {
        debug!(name, ?kind, generation, "store event");
        let _ = self.events.send(WatchEvent {
            kind,
            name: name.to_string(),
            generation,
        });
    }

    /// Bumps the intent's retry nonce, re-arming retries after a terminal failure.
    pub async fn request_retry(&self, name: &str) -> StoreResult<StoredIntent> {
        let mut intent = self.get(name).await?.intent;
        intent.retry_nonce += 1;
        self.apply(intent).await
    }

    /// Number of stored resources.
    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    /// True if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }
}

#[async_trait]
impl IntentStore for MemoryStore {
    async fn get(&self, name: &str) -> StoreResult<StoredIntent> {
        self.resources
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }

    async fn list(&self) -> StoreResult<Vec<StoredIntent>> {
        Ok(self.resources.read().await.values().cloned().collect())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    async fn patch_status(
        &self,
        name: &str,
        expected_version: u64,
        status: ResourceStatus,
    ) -> StoreResult<u64> {
        let mut resources = self.resources.write().await;
        let stored = resources.get_mut(name).ok_or_else(|| StoreError::NotFound {
            name: name.to_string(),
        })?;
        if stored.meta.resource_version != expected_version {
            return Err(StoreError::Conflict {
                name: name.to_string(),
                expected: expected_version,
                actual: stored.meta.resource_version,
            });
        }
        stored.status = Some(status);
        stored.meta.resource_version += 1;
        Ok(stored.meta.resource_version)
    }

    async fn add_finalizer(&self, name: &str, finalizer: &str) -> StoreResult<()> {
        let mut resources = self.resources.write().await;
        let stored = resources.get_mut(name).ok_or_else(|| StoreError::NotFound {
            name: name.to_string(),
        })?;
        if stored.meta.finalizers.insert(finalizer.to_string()) {
            stored.meta.resource_version += 1;
        }
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> StoreResult<()> {
        let removed = {
            let mut resources = self.resources.write().await;
            let stored = resources.get_mut(name).ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })?;
            if stored.meta.finalizers.remove(finalizer) {
                stored.meta.resource_version += 1;
            }
            if stored.meta.deletion_requested && stored.meta.finalizers.is_empty() {
                resources.remove(name)
            } else {
                None
            }
        };
        if let Some(stored) = removed {
            self.emit(WatchEventKind::Deleted, name, stored.meta.generation);
        }
        Ok(())
    }

    async fn apply(&self, intent: ReplicationIntent) -> StoreResult<StoredIntent> {
        let name = intent.name.clone();
        let (stored, kind) = {
            let mut resources = self.resources.write().await;
            match resources.get_mut(&name) {
                Some(stored) if stored.intent == intent => return Ok(stored.clone()),
                Some(stored) => {
                    stored.intent = intent;
                    stored.meta.generation += 1;
                    stored.meta.resource_version += 1;
                    (stored.clone(), WatchEventKind::Modified)
                }
                None => {
                    let stored = StoredIntent {
                        meta: ResourceMeta {
                            name: name.clone(),
                            generation: 1,
                            resource_version: 1,
                            deletion_requested: false,
                            finalizers: BTreeSet::new(),
                        },
                        intent,
                        status: None,
                    };
                    resources.insert(name.clone(), stored.clone());
                    (stored, WatchEventKind::Added)
                }
            }
        };
        self.emit(kind, &name, stored.meta.generation);
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        let event = {
            let mut resources = self.resources.write().await;
            let stored = resources.get_mut(name).ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })?;
            if stored.meta.finalizers.is_empty() {
                let generation = stored.meta.generation;
                resources.remove(name);
                Some((WatchEventKind::Deleted, generation))
            } else if !stored.meta.deletion_requested {
                stored.meta.deletion_requested = true;
                stored.meta.resource_version += 1;
                Some((WatchEventKind::Modified, stored.meta.generation))
            } else {
                None
            }
        };
        if let Some((kind, generation)) = event {
            self.emit(kind, name, generation);
        }
        Ok(())
    }
}

//! Per-volume serialization and the coalescing reconcile queue.
//!
//! `VolumeLocks` guarantees at most one remote operation per volume at a time; the guard
//! is an owned RAII value so it is released on success, failure, panic and cancellation.
//! `ReconcileQueue` guarantees at most one reconcile pass per intent key, folding extra
//! triggers that arrive while a key is queued or in flight into a single follow-up pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::types::VolumeId;

/// One async mutex per volume id.
#[derive(Default)]
pub struct VolumeLocks {
    locks: DashMap<VolumeId, Arc<Mutex<()>>>,
}

impl VolumeLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, volume: &VolumeId) -> Arc<Mutex<()>> {
        self.locks
            .entry(volume.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Waits for exclusive access to `volume`.
    pub async fn lock(&self, volume: &VolumeId) -> OwnedMutexGuard<()> {
        let slot = self.slot(volume);
        let guard = slot.lock_owned().await;
        trace!(volume = %volume, "volume lock acquired");
        guard
    }

    /// Runs `f` while holding the volume's lock.
    pub async fn with_volume_lock<F, T>(&self, volume: &VolumeId, f: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock(volume).await;
        f.await
    }

    /// True if an operation currently holds the volume's lock.
    pub fn is_locked(&self, volume: &VolumeId) -> bool {
        self.locks
            .get(volume)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Drops lock slots nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|_, slot| Arc::strong_count(slot) > 1 || slot.try_lock().is_err());
        let removed = before - self.locks.len();
        if removed > 0 {
            debug!(removed, "pruned idle volume locks");
        }
        removed
    }

    /// Number of tracked volumes.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no volume has been locked yet.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Why a reconcile pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileTrigger {
    /// Initial listing at controller start.
    Startup,
    /// The intent was created or edited.
    IntentChanged,
    /// Deletion was requested or the intent disappeared.
    IntentDeleted,
    /// Scheduled retry or periodic refresh.
    Requeue,
}

/// Result of offering a key to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new pass was scheduled.
    Queued,
    /// Folded into a pass that is already queued or will follow the running one.
    Coalesced,
}

struct QueueState<K> {
    ready: VecDeque<K>,
    pending: HashMap<K, ReconcileTrigger>,
    in_flight: HashSet<K>,
    shutdown: bool,
}

/// Work queue with per-key coalescing and exclusive processing.
pub struct ReconcileQueue<K> {
    state: std::sync::Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> Default for ReconcileQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ReconcileQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(QueueState {
                ready: VecDeque::new(),
                pending: HashMap::new(),
                in_flight: HashSet::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offers `key` for reconciliation. The latest trigger wins.
    pub fn enqueue(&self, key: K, trigger: ReconcileTrigger) -> Admission {
        let admission = {
            let mut state = self.state();
            if state.shutdown {
                return Admission::Coalesced;
            }
            let already = state.pending.insert(key.clone(), trigger).is_some();
            if already {
                Admission::Coalesced
            } else if state.in_flight.contains(&key) {
                // picked up again by `done`
                Admission::Coalesced
            } else {
                state.ready.push_back(key);
                Admission::Queued
            }
        };
        if admission == Admission::Queued {
            self.notify.notify_one();
        }
        admission
    }

    /// Offers `key` after `delay`.
    pub fn enqueue_after(self: &Arc<Self>, key: K, trigger: ReconcileTrigger, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key, trigger);
        });
    }

    /// Waits for the next key no other worker is processing. Returns `None` after
    /// shutdown.
    pub async fn next(&self) -> Option<(K, ReconcileTrigger)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    let trigger = state
                        .pending
                        .remove(&key)
                        .unwrap_or(ReconcileTrigger::Requeue);
                    state.in_flight.insert(key.clone());
                    return Some((key, trigger));
                }
            }
            notified.await;
        }
    }

    /// Marks a pass over `key` finished, scheduling the follow-up pass if triggers
    /// arrived meanwhile.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state();
            state.in_flight.remove(key);
            if state.pending.contains_key(key) && !state.shutdown {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// True if a pass over `key` is running.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.state().in_flight.contains(key)
    }

    /// Keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out work and wakes every waiting worker.
    pub fn shutdown(&self) {
        self.state().shutdown = true;
        self.notify.notify_waiters();
    }

    /// True after `shutdown`.
    pub fn is_shutdown(&self) -> bool {
        self.state().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_volume_lock_serializes() {
        let locks = Arc::new(VolumeLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let vol = VolumeId::new("v1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let vol = vol.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .with_volume_lock(&vol, async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_volume_lock_released_on_cancel() {
        let locks = Arc::new(VolumeLocks::new());
        let vol = VolumeId::new("v1");
        let task = {
            let locks = Arc::clone(&locks);
            let vol = vol.clone();
            tokio::spawn(async move {
                locks
                    .with_volume_lock(&vol, std::future::pending::<()>())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(locks.is_locked(&vol));
        task.abort();
        let _ = task.await;
        assert!(!locks.is_locked(&vol));
        let _guard = tokio::time::timeout(Duration::from_secs(1), locks.lock(&vol))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_volumes_do_not_block() {
        let locks = VolumeLocks::new();
        let _a = locks.lock(&VolumeId::new("a")).await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock(&VolumeId::new("b")))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = VolumeLocks::new();
        let held = locks.lock(&VolumeId::new("held")).await;
        drop(locks.lock(&VolumeId::new("idle")).await);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_locked(&VolumeId::new("held")));
        drop(held);
    }

    #[tokio::test]
    async fn test_queue_coalesces_while_queued() {
        let queue: ReconcileQueue<String> = ReconcileQueue::new();
        assert_eq!(queue.enqueue("a".into(), ReconcileTrigger::Startup), Admission::Queued);
        assert_eq!(
            queue.enqueue("a".into(), ReconcileTrigger::IntentChanged),
            Admission::Coalesced
        );
        assert_eq!(queue.len(), 1);
        let (key, trigger) = queue.next().await.unwrap();
        assert_eq!(key, "a");
        assert_eq!(trigger, ReconcileTrigger::IntentChanged);
    }

    #[tokio::test]
    async fn test_queue_defers_in_flight_key() {
        let queue: ReconcileQueue<String> = ReconcileQueue::new();
        queue.enqueue("a".into(), ReconcileTrigger::Startup);
        let (key, _) = queue.next().await.unwrap();
        assert!(queue.is_in_flight(&key));

        assert_eq!(queue.enqueue("a".into(), ReconcileTrigger::Requeue), Admission::Coalesced);
        assert_eq!(queue.enqueue("a".into(), ReconcileTrigger::Requeue), Admission::Coalesced);
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        let (again, _) = queue.next().await.unwrap();
        assert_eq!(again, "a");
        queue.done(&again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_shutdown_wakes_workers() {
        let queue: Arc<ReconcileQueue<String>> = Arc::new(ReconcileQueue::new());
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        let got = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_delay() {
        let queue: Arc<ReconcileQueue<String>> = Arc::new(ReconcileQueue::new());
        queue.enqueue_after("a".into(), ReconcileTrigger::Requeue, Duration::from_secs(30));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(queue.len(), 1);
    }
}

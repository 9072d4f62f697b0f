//! Upstream admission control.
//!
//! Two layers regulate traffic toward the upstream: a non-waiting per-key
//! lock table (one in-flight call per API key) and a bounded global FIFO
//! with an optional minimum interval between dispatch starts. Both fail
//! closed under overload and release their resources through RAII guards,
//! so a caller cancelled at any point leaves nothing held.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::RelayError;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub min_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_queue: 100,
            min_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct KeyEntry {
    in_use: bool,
    revoked: bool,
}

/// Per-key single-flight table.
///
/// Lock order is table, then entry; never the reverse. Entries that are
/// neither in use nor revoked are removed on release so the table does not
/// accumulate one entry per key ever seen.
#[derive(Clone, Default)]
pub struct KeyLockTable {
    entries: Arc<Mutex<HashMap<i64, Arc<Mutex<KeyEntry>>>>>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-waiting acquire: a second request for the same key is rejected,
    /// not queued.
    pub fn try_acquire(&self, api_key_id: i64) -> Result<KeyLockGuard, RelayError> {
        let mut table = self.entries.lock().expect("key lock table poisoned");
        let entry = table
            .entry(api_key_id)
            .or_insert_with(|| Arc::new(Mutex::new(KeyEntry::default())))
            .clone();
        // The table lock stays held across the entry lock, mirroring
        // release(); otherwise an acquire could race a removal and leave
        // two holders on one key.
        let mut state = entry.lock().expect("key lock entry poisoned");
        if state.revoked {
            return Err(RelayError::key_revoked());
        }
        if state.in_use {
            return Err(RelayError::rate_limited(
                "another request for this api key is already in flight",
            ));
        }
        state.in_use = true;
        drop(state);
        drop(table);
        Ok(KeyLockGuard {
            table: self.clone(),
            api_key_id,
        })
    }

    /// Raise the revocation flag; in-flight holders finish, new arrivals
    /// are rejected with `KEY_REVOKED`.
    pub fn mark_revoked(&self, api_key_id: i64) {
        let mut table = self.entries.lock().expect("key lock table poisoned");
        let entry = table
            .entry(api_key_id)
            .or_insert_with(|| Arc::new(Mutex::new(KeyEntry::default())))
            .clone();
        entry.lock().expect("key lock entry poisoned").revoked = true;
    }

    fn release(&self, api_key_id: i64) {
        let mut table = self.entries.lock().expect("key lock table poisoned");
        let Some(entry) = table.get(&api_key_id).cloned() else {
            return;
        };
        let mut state = entry.lock().expect("key lock entry poisoned");
        state.in_use = false;
        let removable = !state.revoked;
        drop(state);
        if removable {
            table.remove(&api_key_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("key lock table poisoned").len()
    }
}

pub struct KeyLockGuard {
    table: KeyLockTable,
    api_key_id: i64,
}

impl std::fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("api_key_id", &self.api_key_id)
            .finish()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.table.release(self.api_key_id);
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct QueueInner {
    in_flight: usize,
    queue: VecDeque<Waiter>,
    last_dispatch: Option<Instant>,
    next_waiter_id: u64,
}

struct QueueShared {
    config: AdmissionConfig,
    inner: Mutex<QueueInner>,
}

impl QueueShared {
    /// Hand the caller's slot to the next waiter, or free it.
    /// Must be called with `inner` locked.
    fn release_slot_locked(&self, inner: &mut QueueInner) {
        loop {
            match inner.queue.pop_front() {
                Some(waiter) => {
                    if waiter.tx.send(()).is_ok() {
                        return;
                    }
                    // Receiver raced a cancellation; try the next waiter.
                }
                None => {
                    inner.in_flight = inner.in_flight.saturating_sub(1);
                    return;
                }
            }
        }
    }
}

/// Bounded, strictly-FIFO global admission.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<QueueShared>,
}

impl AdmissionQueue {
    pub fn new(config: AdmissionConfig) -> Self {
        let config = AdmissionConfig {
            max_concurrent: config.max_concurrent.max(1),
            ..config
        };
        Self {
            shared: Arc::new(QueueShared {
                config,
                inner: Mutex::new(QueueInner {
                    in_flight: 0,
                    queue: VecDeque::new(),
                    last_dispatch: None,
                    next_waiter_id: 0,
                }),
            }),
        }
    }

    /// Take a slot, waiting in FIFO order if all are busy. `pace` also
    /// enforces the minimum inter-dispatch interval before returning.
    ///
    /// Dropping the returned future while queued removes the waiter;
    /// dropping it after a slot was granted (including mid-pacing) releases
    /// the slot.
    pub async fn acquire(&self, pace: bool) -> Result<SlotPermit, RelayError> {
        let waiting = {
            let mut inner = self.shared.inner.lock().expect("admission queue poisoned");
            if inner.in_flight < self.shared.config.max_concurrent {
                inner.in_flight += 1;
                None
            } else if inner.queue.len() >= self.shared.config.max_queue {
                return Err(RelayError::queue_full());
            } else {
                let id = inner.next_waiter_id;
                inner.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                inner.queue.push_back(Waiter { id, tx });
                Some((id, rx))
            }
        };

        if let Some((id, rx)) = waiting {
            let mut registration = WaiterRegistration {
                queue: self.clone(),
                id,
                active: true,
            };
            match rx.await {
                Ok(()) => {
                    // Slot ownership transferred to this caller.
                    registration.active = false;
                }
                Err(_) => {
                    registration.active = false;
                    return Err(RelayError::internal("admission queue closed"));
                }
            }
        }

        let permit = SlotPermit {
            queue: self.clone(),
        };
        if pace {
            self.pace().await;
        }
        Ok(permit)
    }

    /// Sleep out the remainder of `min_interval` since the last dispatch
    /// start. The shared timestamp is claimed under the queue lock, so
    /// concurrent dispatch starts stay spaced even across slots.
    async fn pace(&self) {
        let min_interval = self.shared.config.min_interval;
        if min_interval.is_zero() {
            let mut inner = self.shared.inner.lock().expect("admission queue poisoned");
            inner.last_dispatch = Some(Instant::now());
            return;
        }
        loop {
            let wait = {
                let mut inner = self.shared.inner.lock().expect("admission queue poisoned");
                let now = Instant::now();
                match inner.last_dispatch {
                    Some(last) if last + min_interval > now => last + min_interval - now,
                    _ => {
                        inner.last_dispatch = Some(now);
                        return;
                    }
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.shared
            .inner
            .lock()
            .expect("admission queue poisoned")
            .queue
            .len()
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.shared
            .inner
            .lock()
            .expect("admission queue poisoned")
            .in_flight
    }
}

/// Removes a cancelled waiter; if the slot was granted in the same race,
/// passes it on instead of leaking it.
struct WaiterRegistration {
    queue: AdmissionQueue,
    id: u64,
    active: bool,
}

impl Drop for WaiterRegistration {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let shared = &self.queue.shared;
        let mut inner = shared.inner.lock().expect("admission queue poisoned");
        let before = inner.queue.len();
        inner.queue.retain(|w| w.id != self.id);
        if inner.queue.len() == before {
            // Not queued any more: a releaser granted us the slot after this
            // future was already being dropped. Hand it along.
            shared.release_slot_locked(&mut inner);
        }
    }
}

/// One global admission slot, released on drop.
pub struct SlotPermit {
    queue: AdmissionQueue,
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let shared = &self.queue.shared;
        let mut inner = shared.inner.lock().expect("admission queue poisoned");
        shared.release_slot_locked(&mut inner);
    }
}

/// Per-key lock plus global slot, composed in acquisition order.
pub struct AdmissionController {
    keys: KeyLockTable,
    queue: AdmissionQueue,
}

/// Resources held for one admitted dispatch. Drop releases the global slot
/// first, then the per-key lock.
pub struct AdmissionPermit {
    _slot: SlotPermit,
    _key: KeyLockGuard,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish()
    }
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            keys: KeyLockTable::new(),
            queue: AdmissionQueue::new(config),
        }
    }

    /// Full admission for one dispatch: per-key lock (non-waiting), then a
    /// global FIFO slot, then pacing when `pace` is set.
    pub async fn admit(&self, api_key_id: i64, pace: bool) -> Result<AdmissionPermit, RelayError> {
        let key = self.keys.try_acquire(api_key_id)?;
        let slot = self.queue.acquire(pace).await?;
        Ok(AdmissionPermit {
            _slot: slot,
            _key: key,
        })
    }

    pub fn mark_revoked(&self, api_key_id: i64) {
        self.keys.mark_revoked(api_key_id);
    }

    /// Handle to the per-key table, for revocation wiring elsewhere.
    pub fn key_locks(&self) -> KeyLockTable {
        self.keys.clone()
    }
}

//! Per-entity mutual exclusion with deadlock avoidance.
//!
//! A [`LockTicket`] is granted for a whole set of ids at once. The set is
//! deduplicated and acquired in lexicographic order, so two executions with
//! overlapping sets always contend on their smallest shared id first and can
//! never each hold what the other is waiting for. One deadline covers the
//! whole batch; when it passes, every lock already granted to the ticket is
//! released before the timeout is reported.
//!
//! Per-id mutexes are created on demand and reference counted. An entry
//! leaves the registry as soon as no ticket holds it and no task waits on
//! it, so the registry tracks in-flight ids rather than every id ever seen.
//!
//! Tickets are not re-entrant: an execution that asks again for an id it
//! already holds waits on itself and fails with a timeout.

use crate::errors::{LockError, LockResult};
use crate::types::EntityId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as EntityMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

type Registry = Mutex<HashMap<EntityId, Arc<EntityMutex<()>>>>;

/// Point-in-time view of the lock registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    /// Ids with a registry entry.
    pub tracked: usize,
    /// Ids currently held by some ticket.
    pub held: usize,
}

/// Grants lock tickets over entity ids.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    registry: Arc<Registry>,
}

impl LockManager {
    /// A manager with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires every id in `ids` within `timeout`, in sorted order.
    #[instrument(name = "lock.acquire", skip(self, ids))]
    pub async fn acquire<I>(&self, ids: I, timeout: Duration) -> LockResult<LockTicket>
    where
        I: IntoIterator<Item = EntityId>,
    {
        let ordered: Vec<EntityId> = ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);

        let handles: Vec<Arc<EntityMutex<()>>> = {
            let mut registry = self.registry.lock();
            ordered
                .iter()
                .map(|id| Arc::clone(registry.entry(id.clone()).or_default()))
                .collect()
        };

        let mut guards = Vec::with_capacity(ordered.len());
        let mut handles = handles.into_iter();
        for id in &ordered {
            let Some(handle) = handles.next() else { break };
            if let Ok(guard) = tokio::time::timeout_at(deadline, handle.lock_owned()).await {
                guards.push(guard);
            } else {
                drop(handles);
                release_in_reverse(&mut guards);
                prune(&self.registry, &ordered);
                warn!(blocked_on = %id, requested = ordered.len(), "[lock.acquire] timed out, partial grants released");
                return Err(LockError::Timeout {
                    ids: ordered.clone(),
                    blocked_on: id.clone(),
                    timeout,
                });
            }
        }

        debug!(count = ordered.len(), "[lock.acquire] ticket granted");
        Ok(LockTicket {
            ids: ordered,
            guards,
            registry: Arc::clone(&self.registry),
            released: false,
        })
    }

    /// Releases a ticket. Releasing an already released ticket does nothing.
    pub fn release(&self, ticket: &mut LockTicket) {
        ticket.release();
    }

    /// Whether some ticket currently holds `id`.
    pub fn is_locked(&self, id: &EntityId) -> bool {
        self.registry
            .lock()
            .get(id)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    /// Registry size and number of held ids.
    pub fn stats(&self) -> LockStats {
        let registry = self.registry.lock();
        LockStats {
            tracked: registry.len(),
            held: registry
                .values()
                .filter(|mutex| mutex.try_lock().is_err())
                .count(),
        }
    }

    /// Drops registry entries nobody holds or waits on; returns how many.
    pub fn sweep_idle(&self) -> usize {
        let mut registry = self.registry.lock();
        let before = registry.len();
        registry.retain(|_, mutex| Arc::strong_count(mutex) > 1 || mutex.try_lock().is_err());
        before - registry.len()
    }
}

/// Locks held by one in-flight execution.
///
/// Dropping the ticket releases it.
#[derive(Debug)]
pub struct LockTicket {
    ids: Vec<EntityId>,
    guards: Vec<OwnedMutexGuard<()>>,
    registry: Arc<Registry>,
    released: bool,
}

impl LockTicket {
    /// The ids covered, in acquisition order.
    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    /// Whether the ticket has been released.
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Releases every lock in reverse acquisition order. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        release_in_reverse(&mut self.guards);
        prune(&self.registry, &self.ids);
        self.released = true;
        debug!(count = self.ids.len(), "[lock.release] ticket released");
    }
}

impl Drop for LockTicket {
    fn drop(&mut self) {
        self.release();
    }
}

fn release_in_reverse(guards: &mut Vec<OwnedMutexGuard<()>>) {
    while let Some(guard) = guards.pop() {
        drop(guard);
    }
}

// Entries referenced only by the registry itself are idle. Acquirers clone
// handles under the same registry lock, so this check cannot race them.
fn prune(registry: &Registry, ids: &[EntityId]) {
    let mut registry = registry.lock();
    for id in ids {
        if registry
            .get(id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            registry.remove(id);
        }
    }
}

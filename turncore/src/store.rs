//! The entity store: authoritative in-memory view of game state.
//!
//! Reads go through `&self`. Direct writes ([`EntityStore::set`],
//! [`EntityStore::delete`]) need `&mut self`, so once a store is shared
//! between executions the only way to mutate it is a committed
//! [`Transaction`](crate::transaction::Transaction) applying a [`ChangeSet`].
//!
//! The shared-state entry points ([`EntityStore::apply`],
//! [`EntityStore::persist`] and [`EntityStore::refresh`]) take a
//! [`CommitToken`], which only the executor can mint. Code outside this
//! crate can neither build a change set nor apply one:
//!
//! ```compile_fail
//! use turncore::store::ChangeSet;
//!
//! let mut changes = ChangeSet::new();
//! ```
//!
//! ```compile_fail
//! use turncore::store::CommitToken;
//!
//! let token = CommitToken::new();
//! ```
//!
//! Nor can it commit a transaction behind the executor's back:
//!
//! ```compile_fail
//! use turncore::store::MemoryEntityStore;
//! use turncore::transaction::Transaction;
//!
//! let store = MemoryEntityStore::new();
//! let mut txn = Transaction::open(&store);
//! let _ = txn.commit();
//! ```
//!
//! Durable variants hook into the execution pipeline through the async
//! `hydrate`/`persist`/`refresh` methods; the plain in-memory store leaves
//! them as no-ops.

use crate::bus::Event;
use crate::entity::Entity;
use crate::errors::RepositoryResult;
use crate::types::{EntityId, EntityKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Proof that a call comes from the execution pipeline.
///
/// Required by every [`EntityStore`] method that mutates shared state;
/// it cannot be constructed outside this crate.
#[derive(Debug, Clone, Copy)]
pub struct CommitToken(());

impl CommitToken {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

/// Everything one transaction changed, applied to a store as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    writes: BTreeMap<EntityId, Arc<Entity>>,
    deletes: BTreeSet<EntityId>,
    events: Vec<Event>,
}

impl ChangeSet {
    pub(crate) const fn new() -> Self {
        Self {
            writes: BTreeMap::new(),
            deletes: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    /// Records the final value of an entity.
    pub(crate) fn write(&mut self, id: EntityId, entity: Arc<Entity>) {
        self.deletes.remove(&id);
        self.writes.insert(id, entity);
    }

    /// Records the removal of an entity.
    pub(crate) fn delete(&mut self, id: EntityId) {
        self.writes.remove(&id);
        self.deletes.insert(id);
    }

    /// Records an event to publish once the changes are committed.
    pub(crate) fn push_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Entities written, by id.
    pub fn writes(&self) -> &BTreeMap<EntityId, Arc<Entity>> {
        &self.writes
    }

    /// Entities removed.
    pub fn deletes(&self) -> &BTreeSet<EntityId> {
        &self.deletes
    }

    /// Events recorded alongside the changes.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Consumes the change set, returning its events.
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Every id written or deleted, in sorted order.
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .writes
            .keys()
            .chain(self.deletes.iter())
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// True when no entity is written or deleted. Events do not count.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Mapping from entity id to entity, shared by all executions.
///
/// Entities are handed out as `Arc<Entity>` so that transaction snapshots
/// share structure with the store until they modify an entity.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Current value of an entity.
    fn get(&self, id: &EntityId) -> Option<Arc<Entity>>;

    /// Inserts or replaces an entity outside any transaction.
    fn set(&mut self, id: EntityId, entity: Entity);

    /// Removes an entity outside any transaction; true if it existed.
    fn delete(&mut self, id: &EntityId) -> bool;

    /// Whether an entity is present.
    fn exists(&self, id: &EntityId) -> bool {
        self.get(id).is_some()
    }

    /// Every entity of one kind, sorted by id.
    fn list_by_kind(&self, kind: &EntityKind) -> Vec<(EntityId, Arc<Entity>)>;

    /// Number of entities held.
    fn count(&self) -> usize;

    /// Applies one committed change set atomically.
    fn apply(&self, changes: &ChangeSet, token: CommitToken);

    /// Present entities among `ids`; absent ids are omitted.
    fn get_bulk(&self, ids: &[EntityId]) -> HashMap<EntityId, Arc<Entity>> {
        ids.iter()
            .filter_map(|id| self.get(id).map(|entity| (id.clone(), entity)))
            .collect()
    }

    /// Makes sure `ids` are resident before a transaction opens over them.
    async fn hydrate(&self, _ids: &[EntityId]) -> RepositoryResult<()> {
        Ok(())
    }

    /// Durably records a change set before it is applied.
    async fn persist(&self, _changes: &ChangeSet, _token: CommitToken) -> RepositoryResult<()> {
        Ok(())
    }

    /// Drops cached copies of `ids` so the next hydrate reads fresh state.
    async fn refresh(&self, _ids: &[EntityId], _token: CommitToken) -> RepositoryResult<()> {
        Ok(())
    }
}

/// Plain in-memory entity store.
///
/// The internal lock only protects the map's memory; logical isolation
/// between executions is the lock manager's job.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<EntityId, Arc<Entity>>>,
}

impl MemoryEntityStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every entity.
    pub fn clear(&mut self) {
        self.entities.get_mut().clear();
    }

    /// Every id held, sorted.
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A point-in-time copy of the whole map.
    pub fn snapshot(&self) -> HashMap<EntityId, Arc<Entity>> {
        self.entities.read().clone()
    }

    pub(crate) fn insert_shared(&self, id: EntityId, entity: Arc<Entity>) {
        self.entities.write().insert(id, entity);
    }

    pub(crate) fn remove_shared(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.entities.write().remove(id)
    }

    pub(crate) fn clear_shared(&self) {
        self.entities.write().clear();
    }
}

impl FromIterator<(EntityId, Entity)> for MemoryEntityStore {
    fn from_iter<T: IntoIterator<Item = (EntityId, Entity)>>(iter: T) -> Self {
        let entities = iter
            .into_iter()
            .map(|(id, entity)| (id, Arc::new(entity)))
            .collect();
        Self {
            entities: RwLock::new(entities),
        }
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    fn get(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.entities.read().get(id).cloned()
    }

    fn set(&mut self, id: EntityId, entity: Entity) {
        self.entities.get_mut().insert(id, Arc::new(entity));
    }

    fn delete(&mut self, id: &EntityId) -> bool {
        self.entities.get_mut().remove(id).is_some()
    }

    fn exists(&self, id: &EntityId) -> bool {
        self.entities.read().contains_key(id)
    }

    fn list_by_kind(&self, kind: &EntityKind) -> Vec<(EntityId, Arc<Entity>)> {
        let mut matches: Vec<(EntityId, Arc<Entity>)> = self
            .entities
            .read()
            .iter()
            .filter(|(_, entity)| entity.kind() == kind)
            .map(|(id, entity)| (id.clone(), Arc::clone(entity)))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches
    }

    fn count(&self) -> usize {
        self.entities.read().len()
    }

    fn apply(&self, changes: &ChangeSet, _token: CommitToken) {
        let mut entities = self.entities.write();
        for (id, entity) in changes.writes() {
            entities.insert(id.clone(), Arc::clone(entity));
        }
        for id in changes.deletes() {
            entities.remove(id);
        }
    }

    fn get_bulk(&self, ids: &[EntityId]) -> HashMap<EntityId, Arc<Entity>> {
        let entities = self.entities.read();
        ids.iter()
            .filter_map(|id| entities.get(id).map(|entity| (id.clone(), Arc::clone(entity))))
            .collect()
    }
}

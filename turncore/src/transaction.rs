//! Copy-on-write working view over an entity store.
//!
//! A transaction pulls entities from its store lazily, on first access,
//! as shared `Arc<Entity>` handles. An entity is only cloned when the
//! command first mutates it (`Arc::make_mut`), so untouched and read-only
//! entities are never copied. Nothing is visible to the store until the
//! executor commits, applying every change as one [`ChangeSet`].
//!
//! Isolation between transactions is provided by the lock manager holding
//! the declared ids for the transaction's whole lifetime, not by this type.

use crate::bus::Event;
use crate::entity::Entity;
use crate::errors::{CommandError, CommandResult, TransactionError};
use crate::store::{ChangeSet, CommitToken, EntityStore};
use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Lifecycle of a transaction. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Accepting reads and writes.
    Open,
    /// Changes applied to the store.
    Committed,
    /// Changes discarded.
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Present(Arc<Entity>),
    Absent,
}

/// Result type for transaction lifecycle operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// An isolated working view over an [`EntityStore`].
pub struct Transaction<'s> {
    store: &'s dyn EntityStore,
    working: HashMap<EntityId, Slot>,
    changed: BTreeSet<EntityId>,
    events: Vec<Event>,
    state: TransactionState,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("touched", &self.working.len())
            .field("changed", &self.changed)
            .finish_non_exhaustive()
    }
}

impl<'s> Transaction<'s> {
    /// Opens a transaction over `store`.
    pub fn open(store: &'s dyn EntityStore) -> Self {
        Self {
            store,
            working: HashMap::new(),
            changed: BTreeSet::new(),
            events: Vec::new(),
            state: TransactionState::Open,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// True until commit or rollback.
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Open
    }

    fn ensure_open(&self) -> TransactionResult<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            state => Err(TransactionError::AlreadyFinalized { state }),
        }
    }

    fn slot(&mut self, id: &EntityId) -> &mut Slot {
        let store = self.store;
        self.working.entry(id.clone()).or_insert_with(|| {
            trace!(entity = %id, "[transaction.load] pulling entity into working view");
            store.get(id).map_or(Slot::Absent, Slot::Present)
        })
    }

    /// Reads an entity through the working view.
    pub fn get(&mut self, id: &EntityId) -> TransactionResult<Option<&Entity>> {
        self.ensure_open()?;
        Ok(match self.slot(id) {
            Slot::Present(entity) => Some(&**entity),
            Slot::Absent => None,
        })
    }

    /// Mutable access to an entity; the entity is copied on first mutation.
    pub fn get_mut(&mut self, id: &EntityId) -> TransactionResult<Option<&mut Entity>> {
        self.ensure_open()?;
        let present = matches!(self.slot(id), Slot::Present(_));
        if !present {
            return Ok(None);
        }
        self.changed.insert(id.clone());
        Ok(match self.working.get_mut(id) {
            Some(Slot::Present(entity)) => Some(Arc::make_mut(entity)),
            _ => None,
        })
    }

    /// Like [`Transaction::get`], but a missing entity is `EntityNotFound`.
    pub fn require(&mut self, id: &EntityId) -> CommandResult<&Entity> {
        self.get(id)?
            .ok_or_else(|| CommandError::EntityNotFound(id.clone()))
    }

    /// Like [`Transaction::get_mut`], but a missing entity is `EntityNotFound`.
    pub fn require_mut(&mut self, id: &EntityId) -> CommandResult<&mut Entity> {
        self.get_mut(id)?
            .ok_or_else(|| CommandError::EntityNotFound(id.clone()))
    }

    /// Whether an entity exists in the working view.
    pub fn exists(&mut self, id: &EntityId) -> TransactionResult<bool> {
        self.ensure_open()?;
        Ok(matches!(self.slot(id), Slot::Present(_)))
    }

    /// Creates or replaces an entity.
    pub fn set(&mut self, id: EntityId, entity: Entity) -> TransactionResult<()> {
        self.ensure_open()?;
        self.changed.insert(id.clone());
        self.working.insert(id, Slot::Present(Arc::new(entity)));
        Ok(())
    }

    /// Removes an entity; returns whether it existed in the working view.
    pub fn delete(&mut self, id: &EntityId) -> TransactionResult<bool> {
        self.ensure_open()?;
        let slot = self.slot(id);
        let existed = matches!(slot, Slot::Present(_));
        *slot = Slot::Absent;
        if existed {
            self.changed.insert(id.clone());
        }
        Ok(existed)
    }

    /// Records an event to publish after a successful commit.
    pub fn emit(&mut self, event: Event) -> TransactionResult<()> {
        self.ensure_open()?;
        self.events.push(event);
        Ok(())
    }

    /// Every id read or written so far, including ids found absent.
    pub fn touched_ids(&self) -> BTreeSet<EntityId> {
        self.working.keys().cloned().collect()
    }

    /// Ids that commit would write or delete.
    pub fn changed_ids(&self) -> &BTreeSet<EntityId> {
        &self.changed
    }

    /// The change set commit would apply, without applying it.
    pub fn pending_changes(&self) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for id in &self.changed {
            match self.working.get(id) {
                Some(Slot::Present(entity)) => changes.write(id.clone(), Arc::clone(entity)),
                Some(Slot::Absent) | None => changes.delete(id.clone()),
            }
        }
        for event in &self.events {
            changes.push_event(event.clone());
        }
        changes
    }

    /// Applies every change to the store and finalizes the transaction.
    ///
    /// Only the executor commits, after it has persisted the changes.
    pub(crate) fn commit(&mut self) -> TransactionResult<ChangeSet> {
        self.ensure_open()?;
        let changes = self.pending_changes();
        self.store.apply(&changes, CommitToken::new());
        self.finish(TransactionState::Committed);
        Ok(changes)
    }

    /// Discards every change and finalizes the transaction.
    pub fn rollback(&mut self) -> TransactionResult<()> {
        self.ensure_open()?;
        self.finish(TransactionState::RolledBack);
        Ok(())
    }

    fn finish(&mut self, state: TransactionState) {
        self.working.clear();
        self.changed.clear();
        self.events.clear();
        self.state = state;
    }
}

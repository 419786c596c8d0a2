//! Entity store backed by a durable [`Repository`].
//!
//! The store keeps an in-memory cache of every entity it has seen, the
//! version it last observed for each, and the ids it knows to be absent.
//! Before a transaction opens, the executor calls [`EntityStore::hydrate`]
//! with the command's dependencies; cache misses among them are fetched
//! with a single `load_bulk`.
//!
//! With [`FlushPolicy::WriteThrough`] every committed change set is written
//! as one atomic batch before it becomes visible in the cache; a version
//! conflict evicts the contended ids and fails the commit. With
//! [`FlushPolicy::Deferred`] commits only mark entities dirty and
//! [`PersistentEntityStore::flush`] writes them all in one pass.

use crate::config::FlushPolicy;
use crate::entity::Entity;
use crate::errors::{RepositoryError, RepositoryResult};
use crate::repository::{Repository, WriteBatch};
use crate::store::{ChangeSet, CommitToken, EntityStore, MemoryEntityStore};
use crate::types::{EntityId, EntityKind, EntityVersion};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default)]
struct Tracking {
    versions: HashMap<EntityId, EntityVersion>,
    absent: HashSet<EntityId>,
    dirty: BTreeSet<EntityId>,
}

impl Tracking {
    fn version_of(&self, id: &EntityId) -> EntityVersion {
        self.versions
            .get(id)
            .copied()
            .unwrap_or_else(EntityVersion::initial)
    }

    fn forget(&mut self, id: &EntityId) {
        self.versions.remove(id);
        self.absent.remove(id);
        self.dirty.remove(id);
    }
}

/// Write-back cache over a [`Repository`].
#[derive(Debug)]
pub struct PersistentEntityStore<R> {
    repository: R,
    cache: MemoryEntityStore,
    tracking: Mutex<Tracking>,
    policy: FlushPolicy,
}

impl<R: Repository> PersistentEntityStore<R> {
    /// A store with an empty cache over `repository`.
    pub fn new(repository: R, policy: FlushPolicy) -> Self {
        Self {
            repository,
            cache: MemoryEntityStore::new(),
            tracking: Mutex::new(Tracking::default()),
            policy,
        }
    }

    /// Shorthand for [`FlushPolicy::WriteThrough`].
    pub fn write_through(repository: R) -> Self {
        Self::new(repository, FlushPolicy::WriteThrough)
    }

    /// Shorthand for [`FlushPolicy::Deferred`].
    pub fn deferred(repository: R) -> Self {
        Self::new(repository, FlushPolicy::Deferred)
    }

    /// The backing repository.
    pub const fn repository(&self) -> &R {
        &self.repository
    }

    /// The configured flush policy.
    pub const fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Version last observed for `id`; 0 when unknown or absent.
    pub fn version_of(&self, id: &EntityId) -> EntityVersion {
        self.tracking.lock().version_of(id)
    }

    /// Whether `id` has unflushed changes.
    pub fn is_dirty(&self, id: &EntityId) -> bool {
        self.tracking.lock().dirty.contains(id)
    }

    /// Number of entities with unflushed changes.
    pub fn dirty_count(&self) -> usize {
        self.tracking.lock().dirty.len()
    }

    /// Number of entities in the repository, as opposed to in the cache.
    pub async fn durable_count(&self) -> RepositoryResult<usize> {
        self.repository.count().await
    }

    /// Reads one entity, loading it from the repository on a cache miss.
    pub async fn load_entity(&self, id: &EntityId) -> RepositoryResult<Option<Arc<Entity>>> {
        self.hydrate(std::slice::from_ref(id)).await?;
        Ok(self.cache.get(id))
    }

    /// Reads many entities; misses are fetched with one bulk load.
    pub async fn get_entities_bulk(
        &self,
        ids: &[EntityId],
    ) -> RepositoryResult<HashMap<EntityId, Arc<Entity>>> {
        self.hydrate(ids).await?;
        Ok(self.cache.get_bulk(ids))
    }

    /// Discards the cached copy of `id` and reads it again.
    ///
    /// Unflushed local changes to `id` are lost.
    pub async fn reload(&self, id: &EntityId) -> RepositoryResult<Option<Arc<Entity>>> {
        self.evict(std::slice::from_ref(id));
        self.load_entity(id).await
    }

    /// Writes every dirty entity in one atomic batch; returns how many.
    ///
    /// On a version conflict nothing is written and the dirty set is kept;
    /// [`PersistentEntityStore::reload`] the conflicting id to discard the
    /// local change.
    #[instrument(name = "persistent.flush", skip(self))]
    pub async fn flush(&self) -> RepositoryResult<usize> {
        let (batch, flushed) = {
            let tracking = self.tracking.lock();
            let mut batch = WriteBatch::new();
            let mut flushed = Vec::with_capacity(tracking.dirty.len());
            for id in &tracking.dirty {
                let current = self.cache.get(id);
                match &current {
                    Some(entity) => {
                        batch.save(id.clone(), entity.as_ref().clone(), tracking.version_of(id));
                    }
                    None => {
                        batch.delete(id.clone(), Some(tracking.version_of(id)));
                    }
                }
                flushed.push((id.clone(), current));
            }
            (batch, flushed)
        };

        if batch.is_empty() {
            return Ok(0);
        }

        let versions = match self.repository.commit_batch(batch).await {
            Ok(versions) => versions,
            Err(error) => {
                warn!(error = %error, "[persistent.flush] batch rejected, dirty set kept");
                return Err(error);
            }
        };

        let mut tracking = self.tracking.lock();
        for (id, written) in &flushed {
            match versions.get(id) {
                Some(version) => {
                    tracking.versions.insert(id.clone(), *version);
                }
                None => {
                    tracking.versions.remove(id);
                }
            }
            // Only clean if nothing committed over the value we wrote.
            let unchanged = match (self.cache.get(id), written) {
                (Some(now), Some(then)) => Arc::ptr_eq(&now, then),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                tracking.dirty.remove(id);
            }
        }
        info!(count = flushed.len(), "[persistent.flush] dirty entities persisted");
        Ok(flushed.len())
    }

    /// Empties both the repository and the cache.
    pub async fn clear(&self) -> RepositoryResult<()> {
        self.repository.clear().await?;
        self.cache.clear_shared();
        *self.tracking.lock() = Tracking::default();
        Ok(())
    }

    fn evict(&self, ids: &[EntityId]) {
        let mut tracking = self.tracking.lock();
        for id in ids {
            self.cache.remove_shared(id);
            tracking.forget(id);
        }
    }

    fn batch_for(&self, changes: &ChangeSet) -> WriteBatch {
        let tracking = self.tracking.lock();
        let mut batch = WriteBatch::new();
        for (id, entity) in changes.writes() {
            batch.save(id.clone(), entity.as_ref().clone(), tracking.version_of(id));
        }
        for id in changes.deletes() {
            batch.delete(id.clone(), Some(tracking.version_of(id)));
        }
        batch
    }
}

#[async_trait]
impl<R: Repository> EntityStore for PersistentEntityStore<R> {
    fn get(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.cache.get(id)
    }

    fn set(&mut self, id: EntityId, entity: Entity) {
        let tracking = self.tracking.get_mut();
        tracking.absent.remove(&id);
        tracking.dirty.insert(id.clone());
        self.cache.set(id, entity);
    }

    fn delete(&mut self, id: &EntityId) -> bool {
        let tracking = self.tracking.get_mut();
        tracking.absent.insert(id.clone());
        tracking.dirty.insert(id.clone());
        self.cache.delete(id)
    }

    fn exists(&self, id: &EntityId) -> bool {
        self.cache.exists(id)
    }

    fn list_by_kind(&self, kind: &EntityKind) -> Vec<(EntityId, Arc<Entity>)> {
        self.cache.list_by_kind(kind)
    }

    /// Resident entities only; see [`PersistentEntityStore::durable_count`].
    fn count(&self) -> usize {
        self.cache.count()
    }

    fn apply(&self, changes: &ChangeSet, token: CommitToken) {
        let mut tracking = self.tracking.lock();
        self.cache.apply(changes, token);
        for id in changes.writes().keys() {
            tracking.absent.remove(id);
        }
        for id in changes.deletes() {
            tracking.absent.insert(id.clone());
        }
        if self.policy == FlushPolicy::Deferred {
            tracking.dirty.extend(changes.ids());
        }
    }

    fn get_bulk(&self, ids: &[EntityId]) -> HashMap<EntityId, Arc<Entity>> {
        self.cache.get_bulk(ids)
    }

    #[instrument(name = "persistent.hydrate", skip(self, ids), fields(requested = ids.len()))]
    async fn hydrate(&self, ids: &[EntityId]) -> RepositoryResult<()> {
        let missing: Vec<EntityId> = {
            let tracking = self.tracking.lock();
            ids.iter()
                .filter(|id| !tracking.absent.contains(*id) && !self.cache.exists(id))
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let mut loaded = self.repository.load_bulk(&missing).await?;
        let found = loaded.len();
        let requested = missing.len();
        let mut tracking = self.tracking.lock();
        for id in missing {
            // Another execution may have hydrated or created it meanwhile.
            if self.cache.exists(&id) || tracking.dirty.contains(&id) {
                continue;
            }
            match loaded.remove(&id) {
                Some(record) => {
                    tracking.versions.insert(id.clone(), record.version);
                    tracking.absent.remove(&id);
                    self.cache.insert_shared(id, Arc::new(record.entity));
                }
                None => {
                    tracking.versions.remove(&id);
                    tracking.absent.insert(id);
                }
            }
        }
        debug!(requested, found, "[persistent.hydrate] cache misses loaded");
        Ok(())
    }

    #[instrument(name = "persistent.persist", skip(self, changes), fields(entities = changes.ids().len()))]
    async fn persist(&self, changes: &ChangeSet, _token: CommitToken) -> RepositoryResult<()> {
        if self.policy == FlushPolicy::Deferred || changes.is_empty() {
            return Ok(());
        }

        let batch = self.batch_for(changes);
        match self.repository.commit_batch(batch).await {
            Ok(versions) => {
                let mut tracking = self.tracking.lock();
                for id in changes.deletes() {
                    tracking.versions.remove(id);
                }
                tracking.versions.extend(versions);
                Ok(())
            }
            Err(error) => {
                if let RepositoryError::VersionConflict { id, .. } = &error {
                    warn!(entity = %id, "[persistent.persist] version conflict, evicting stale copy");
                    self.evict(std::slice::from_ref(id));
                }
                Err(error)
            }
        }
    }

    async fn refresh(&self, ids: &[EntityId], _token: CommitToken) -> RepositoryResult<()> {
        self.evict(ids);
        debug!(count = ids.len(), "[persistent.refresh] cached copies dropped");
        Ok(())
    }
}

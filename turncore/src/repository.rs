//! Durable repository contract with optimistic concurrency.
//!
//! Every persisted entity carries a version. A record that does not exist
//! has the implicit version 0, so creation is just a write that expects
//! version 0. A write succeeds only when the version the caller last
//! observed still equals the stored one; the stored version then advances
//! by exactly one. Losing that race is a [`RepositoryError::VersionConflict`].
//!
//! `load_bulk` must be one batched retrieval, never N single loads, and it
//! silently omits ids that do not exist.

use crate::entity::Entity;
use crate::errors::{RepositoryError, RepositoryResult};
use crate::types::{EntityId, EntityKind, EntityVersion};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// An entity document with its version.
///
/// When passed to [`Repository::save`], `version` is the version the caller
/// last observed. When returned from a load, it is the stored version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// The document
    pub entity: Entity,
    /// Observed or stored version
    pub version: EntityVersion,
}

impl PersistedRecord {
    /// Pairs an entity with a version.
    pub const fn new(entity: Entity, version: EntityVersion) -> Self {
        Self { entity, version }
    }

    /// A record that has never been persisted.
    pub fn fresh(entity: Entity) -> Self {
        Self::new(entity, EntityVersion::initial())
    }
}

/// One operation of a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or replace an entity.
    Save {
        /// Target entity
        id: EntityId,
        /// New document
        entity: Entity,
        /// Version the writer last observed
        expected: EntityVersion,
    },
    /// Remove an entity.
    Delete {
        /// Target entity
        id: EntityId,
        /// Version the writer last observed; `None` deletes unconditionally
        expected: Option<EntityVersion>,
    },
}

impl WriteOp {
    /// The entity this operation targets.
    pub const fn id(&self) -> &EntityId {
        match self {
            Self::Save { id, .. } | Self::Delete { id, .. } => id,
        }
    }

    /// The version this operation requires, if any.
    pub const fn expected(&self) -> Option<EntityVersion> {
        match self {
            Self::Save { expected, .. } => Some(*expected),
            Self::Delete { expected, .. } => *expected,
        }
    }
}

/// A set of writes committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a conditional save.
    pub fn save(&mut self, id: EntityId, entity: Entity, expected: EntityVersion) -> &mut Self {
        self.ops.push(WriteOp::Save {
            id,
            entity,
            expected,
        });
        self
    }

    /// Adds a delete, conditional when `expected` is given.
    pub fn delete(&mut self, id: EntityId, expected: Option<EntityVersion>) -> &mut Self {
        self.ops.push(WriteOp::Delete { id, expected });
        self
    }

    /// The operations in insertion order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the batch.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Ids targeted by the batch.
    pub fn ids(&self) -> Vec<EntityId> {
        self.ops.iter().map(|op| op.id().clone()).collect()
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when the batch holds no operation.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Checks a writer's expected version against the stored one.
pub fn verify_version(
    id: &EntityId,
    expected: EntityVersion,
    current: EntityVersion,
) -> RepositoryResult<()> {
    if expected == current {
        Ok(())
    } else {
        Err(RepositoryError::VersionConflict {
            id: id.clone(),
            expected,
            current,
        })
    }
}

/// Durable storage for entities.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Conditionally writes one entity; returns the new stored version.
    async fn save(&self, id: &EntityId, record: &PersistedRecord) -> RepositoryResult<EntityVersion>;

    /// Loads one entity.
    async fn load(&self, id: &EntityId) -> RepositoryResult<Option<PersistedRecord>>;

    /// Loads many entities in one batched retrieval; absent ids are omitted.
    async fn load_bulk(&self, ids: &[EntityId]) -> RepositoryResult<HashMap<EntityId, PersistedRecord>>;

    /// Removes an entity unconditionally; returns whether it existed.
    async fn delete(&self, id: &EntityId) -> RepositoryResult<bool>;

    /// Whether an entity is stored.
    async fn exists(&self, id: &EntityId) -> RepositoryResult<bool>;

    /// Every stored entity of one kind, sorted by id.
    async fn list_by_kind(&self, kind: &EntityKind) -> RepositoryResult<Vec<(EntityId, PersistedRecord)>>;

    /// Number of stored entities.
    async fn count(&self) -> RepositoryResult<usize>;

    /// Removes every stored entity.
    async fn clear(&self) -> RepositoryResult<()>;

    /// Applies every operation or none of them.
    ///
    /// All expected versions are verified before anything is written.
    /// Returns the new version of every saved entity.
    async fn commit_batch(&self, batch: WriteBatch) -> RepositoryResult<HashMap<EntityId, EntityVersion>>;
}

#[async_trait]
impl<R> Repository for Arc<R>
where
    R: Repository + ?Sized,
{
    async fn save(&self, id: &EntityId, record: &PersistedRecord) -> RepositoryResult<EntityVersion> {
        (**self).save(id, record).await
    }

    async fn load(&self, id: &EntityId) -> RepositoryResult<Option<PersistedRecord>> {
        (**self).load(id).await
    }

    async fn load_bulk(&self, ids: &[EntityId]) -> RepositoryResult<HashMap<EntityId, PersistedRecord>> {
        (**self).load_bulk(ids).await
    }

    async fn delete(&self, id: &EntityId) -> RepositoryResult<bool> {
        (**self).delete(id).await
    }

    async fn exists(&self, id: &EntityId) -> RepositoryResult<bool> {
        (**self).exists(id).await
    }

    async fn list_by_kind(&self, kind: &EntityKind) -> RepositoryResult<Vec<(EntityId, PersistedRecord)>> {
        (**self).list_by_kind(kind).await
    }

    async fn count(&self) -> RepositoryResult<usize> {
        (**self).count().await
    }

    async fn clear(&self) -> RepositoryResult<()> {
        (**self).clear().await
    }

    async fn commit_batch(&self, batch: WriteBatch) -> RepositoryResult<HashMap<EntityId, EntityVersion>> {
        (**self).commit_batch(batch).await
    }
}

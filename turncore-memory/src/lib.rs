//! In-memory repository for `turncore`
//!
//! This crate provides an in-memory implementation of the `Repository`
//! trait from the turncore crate, useful for tests and for games that do not
//! need state to survive a restart. It follows the same version rules as
//! the durable backends, so code exercised against it behaves the same way
//! against SQLite.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use turncore::errors::RepositoryResult;
use turncore::repository::{verify_version, PersistedRecord, Repository, WriteBatch, WriteOp};
use turncore::types::{EntityId, EntityKind, EntityVersion};

/// Thread-safe in-memory repository.
///
/// Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    // Stored records carry their current version
    records: Arc<RwLock<HashMap<EntityId, PersistedRecord>>>,
}

impl InMemoryRepository {
    /// Create a new empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored version of `id`; 0 when absent.
    pub async fn version_of(&self, id: &EntityId) -> EntityVersion {
        self.records
            .read()
            .await
            .get(id)
            .map_or_else(EntityVersion::initial, |record| record.version)
    }
}

fn current_version(records: &HashMap<EntityId, PersistedRecord>, id: &EntityId) -> EntityVersion {
    records
        .get(id)
        .map_or_else(EntityVersion::initial, |record| record.version)
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save(&self, id: &EntityId, record: &PersistedRecord) -> RepositoryResult<EntityVersion> {
        let mut records = self.records.write().await;
        let current = current_version(&records, id);
        verify_version(id, record.version, current)?;

        let version = current.next();
        records.insert(id.clone(), PersistedRecord::new(record.entity.clone(), version));
        Ok(version)
    }

    async fn load(&self, id: &EntityId) -> RepositoryResult<Option<PersistedRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn load_bulk(&self, ids: &[EntityId]) -> RepositoryResult<HashMap<EntityId, PersistedRecord>> {
        let records = self.records.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|record| (id.clone(), record.clone())))
            .collect())
    }

    async fn delete(&self, id: &EntityId) -> RepositoryResult<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn exists(&self, id: &EntityId) -> RepositoryResult<bool> {
        Ok(self.records.read().await.contains_key(id))
    }

    async fn list_by_kind(&self, kind: &EntityKind) -> RepositoryResult<Vec<(EntityId, PersistedRecord)>> {
        let records = self.records.read().await;
        let mut matches: Vec<(EntityId, PersistedRecord)> = records
            .iter()
            .filter(|(_, record)| record.entity.kind() == kind)
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }

    async fn count(&self) -> RepositoryResult<usize> {
        Ok(self.records.read().await.len())
    }

    async fn clear(&self) -> RepositoryResult<()> {
        self.records.write().await.clear();
        Ok(())
    }

    #[instrument(name = "memory.commit_batch", skip(self, batch), fields(ops = batch.len()))]
    async fn commit_batch(&self, batch: WriteBatch) -> RepositoryResult<HashMap<EntityId, EntityVersion>> {
        let mut records = self.records.write().await;

        // First, verify every expected version against the state the batch
        // would see, so a later op on the same id observes the earlier one
        let mut staged: HashMap<&EntityId, Option<EntityVersion>> = HashMap::new();
        for op in batch.ops() {
            let current = staged
                .get(op.id())
                .copied()
                .unwrap_or_else(|| records.get(op.id()).map(|record| record.version))
                .unwrap_or_else(EntityVersion::initial);
            if let Some(expected) = op.expected() {
                verify_version(op.id(), expected, current)?;
            }
            let after = match op {
                WriteOp::Save { .. } => Some(current.next()),
                WriteOp::Delete { .. } => None,
            };
            staged.insert(op.id(), after);
        }

        // All versions match, proceed with writes
        let mut new_versions = HashMap::new();
        for op in batch.into_ops() {
            match op {
                WriteOp::Save { id, entity, .. } => {
                    let version = current_version(&records, &id).next();
                    records.insert(id.clone(), PersistedRecord::new(entity, version));
                    new_versions.insert(id, version);
                }
                WriteOp::Delete { id, .. } => {
                    records.remove(&id);
                    new_versions.remove(&id);
                }
            }
        }

        debug!(written = new_versions.len(), "[memory.commit_batch] batch applied");
        Ok(new_versions)
    }
}

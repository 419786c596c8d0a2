//! Deterministic contention.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::debug;
use turncore::errors::{RepositoryError, RepositoryResult};
use turncore::repository::{PersistedRecord, Repository, WriteBatch};
use turncore::types::{EntityId, EntityKind, EntityVersion};

/// Repository wrapper whose next N writes lose an optimistic race.
///
/// Each of the first N `save`/`commit_batch` calls fails with
/// `VersionConflict` without touching the wrapped repository; later calls
/// delegate. Reads always delegate.
#[derive(Debug)]
pub struct ConflictingRepository<R> {
    repository: R,
    remaining: AtomicU32,
    injected: AtomicU32,
}

impl<R> ConflictingRepository<R> {
    /// Wraps `repository`, failing the next `conflicts` writes.
    pub const fn new(repository: R, conflicts: u32) -> Self {
        Self {
            repository,
            remaining: AtomicU32::new(conflicts),
            injected: AtomicU32::new(0),
        }
    }

    /// The wrapped repository.
    pub const fn inner(&self) -> &R {
        &self.repository
    }

    /// Conflicts injected so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    /// Conflicts still to inject.
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    fn take_conflict(&self, id: &EntityId, expected: EntityVersion) -> RepositoryResult<()> {
        let lost = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            self.injected.fetch_add(1, Ordering::SeqCst);
            debug!(entity = %id, "[conflicting.write] injected version conflict");
            return Err(RepositoryError::VersionConflict {
                id: id.clone(),
                expected,
                current: expected.next(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<R: Repository> Repository for ConflictingRepository<R> {
    async fn save(&self, id: &EntityId, record: &PersistedRecord) -> RepositoryResult<EntityVersion> {
        self.take_conflict(id, record.version)?;
        self.repository.save(id, record).await
    }

    async fn load(&self, id: &EntityId) -> RepositoryResult<Option<PersistedRecord>> {
        self.repository.load(id).await
    }

    async fn load_bulk(&self, ids: &[EntityId]) -> RepositoryResult<HashMap<EntityId, PersistedRecord>> {
        self.repository.load_bulk(ids).await
    }

    async fn delete(&self, id: &EntityId) -> RepositoryResult<bool> {
        self.repository.delete(id).await
    }

    async fn exists(&self, id: &EntityId) -> RepositoryResult<bool> {
        self.repository.exists(id).await
    }

    async fn list_by_kind(&self, kind: &EntityKind) -> RepositoryResult<Vec<(EntityId, PersistedRecord)>> {
        self.repository.list_by_kind(kind).await
    }

    async fn count(&self) -> RepositoryResult<usize> {
        self.repository.count().await
    }

    async fn clear(&self) -> RepositoryResult<()> {
        self.repository.clear().await
    }

    async fn commit_batch(&self, batch: WriteBatch) -> RepositoryResult<HashMap<EntityId, EntityVersion>> {
        if let Some(op) = batch.ops().first() {
            self.take_conflict(op.id(), op.expected().unwrap_or_else(EntityVersion::initial))?;
        }
        self.repository.commit_batch(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turncore::entity::Entity;
    use turncore_memory::InMemoryRepository;

    #[tokio::test]
    async fn exactly_n_writes_conflict_then_writes_go_through() {
        let repo = ConflictingRepository::new(InMemoryRepository::new(), 2);
        let id = EntityId::try_new("boss").unwrap();
        let record = PersistedRecord::fresh(Entity::new(EntityKind::try_new("boss").unwrap()));

        assert!(repo.save(&id, &record).await.unwrap_err().is_version_conflict());
        assert!(repo.save(&id, &record).await.unwrap_err().is_version_conflict());
        assert_eq!(repo.save(&id, &record).await, Ok(EntityVersion::new(1)));

        assert_eq!(repo.injected(), 2);
        assert_eq!(repo.remaining(), 0);
    }

    #[tokio::test]
    async fn empty_batches_do_not_consume_conflicts() {
        let repo = ConflictingRepository::new(InMemoryRepository::new(), 1);
        assert!(repo.commit_batch(WriteBatch::new()).await.unwrap().is_empty());
        assert_eq!(repo.remaining(), 1);
    }
}

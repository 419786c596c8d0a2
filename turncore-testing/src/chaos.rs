//! Random fault injection for repositories.

use std::collections::HashMap;

use async_trait::async_trait;
use nutype::nutype;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{random, Rng, SeedableRng};
use turncore::errors::{RepositoryError, RepositoryResult};
use turncore::repository::{PersistedRecord, Repository, WriteBatch};
use turncore::types::{EntityId, EntityKind, EntityVersion};

/// Probability value for fault injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject and 1.0 means always inject.
///
/// # Examples
///
/// ```
/// use turncore_testing::chaos::Probability;
///
/// let sometimes = Probability::try_new(0.5).unwrap();
/// assert_eq!(sometimes.into_inner(), 0.5);
///
/// // Values outside [0.0, 1.0] are rejected
/// assert!(Probability::try_new(1.5).is_err());
/// assert!(Probability::try_new(-0.1).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    default = 0.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into, Default)
)]
pub struct Probability(f64);

/// What a [`ChaosRepository`] injects, and how often.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    version_conflict_probability: Probability,
}

impl ChaosConfig {
    /// Seeded with 0, so every run injects at the same points.
    pub fn deterministic() -> Self {
        Self::seeded(0)
    }

    /// Seeded with `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            deterministic_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Chance that any operation fails with `StoreFailure`.
    #[must_use]
    pub const fn with_failure_probability(mut self, probability: Probability) -> Self {
        self.failure_probability = probability;
        self
    }

    /// Chance that a write fails with `VersionConflict`.
    #[must_use]
    pub const fn with_version_conflict_probability(mut self, probability: Probability) -> Self {
        self.version_conflict_probability = probability;
        self
    }
}

/// Extension trait for wrapping any repository in chaos.
pub trait ChaosRepositoryExt: Sized {
    /// Wraps `self` with the given injection rates.
    fn with_chaos(self, config: ChaosConfig) -> ChaosRepository<Self>;
}

impl<R: Repository> ChaosRepositoryExt for R {
    fn with_chaos(self, config: ChaosConfig) -> ChaosRepository<Self> {
        ChaosRepository::new(self, config)
    }
}

/// Repository wrapper that fails randomly.
///
/// Injected conflicts report the caller's expected version as stale, the
/// same shape a lost race has.
#[derive(Debug)]
pub struct ChaosRepository<R> {
    repository: R,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl<R> ChaosRepository<R> {
    /// Wraps `repository`.
    pub fn new(repository: R, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            repository,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// The wrapped repository.
    pub const fn inner(&self) -> &R {
        &self.repository
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability = probability.into_inner();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(probability)
    }

    fn inject_failure(&self, operation: &str) -> RepositoryResult<()> {
        if self.should_inject(self.config.failure_probability) {
            return Err(RepositoryError::store_failure(operation, "injected failure"));
        }
        Ok(())
    }

    fn inject_conflict(&self, id: &EntityId, expected: EntityVersion) -> RepositoryResult<()> {
        if self.should_inject(self.config.version_conflict_probability) {
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
impl<R: Repository> Repository for ChaosRepository<R> {
    async fn save(&self, id: &EntityId, record: &PersistedRecord) -> RepositoryResult<EntityVersion> {
        self.inject_conflict(id, record.version)?;
        self.inject_failure("save")?;
        self.repository.save(id, record).await
    }

    async fn load(&self, id: &EntityId) -> RepositoryResult<Option<PersistedRecord>> {
        self.inject_failure("load")?;
        self.repository.load(id).await
    }

    async fn load_bulk(&self, ids: &[EntityId]) -> RepositoryResult<HashMap<EntityId, PersistedRecord>> {
        self.inject_failure("load_bulk")?;
        self.repository.load_bulk(ids).await
    }

    async fn delete(&self, id: &EntityId) -> RepositoryResult<bool> {
        self.inject_failure("delete")?;
        self.repository.delete(id).await
    }

    async fn exists(&self, id: &EntityId) -> RepositoryResult<bool> {
        self.inject_failure("exists")?;
        self.repository.exists(id).await
    }

    async fn list_by_kind(&self, kind: &EntityKind) -> RepositoryResult<Vec<(EntityId, PersistedRecord)>> {
        self.inject_failure("list_by_kind")?;
        self.repository.list_by_kind(kind).await
    }

    async fn count(&self) -> RepositoryResult<usize> {
        self.inject_failure("count")?;
        self.repository.count().await
    }

    async fn clear(&self) -> RepositoryResult<()> {
        self.repository.clear().await
    }

    async fn commit_batch(&self, batch: WriteBatch) -> RepositoryResult<HashMap<EntityId, EntityVersion>> {
        if let Some(op) = batch.ops().first() {
            self.inject_conflict(op.id(), op.expected().unwrap_or_else(EntityVersion::initial))?;
        }
        self.inject_failure("commit_batch")?;
        self.repository.commit_batch(batch).await
    }
}

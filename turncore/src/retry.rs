//! Bounded retry on optimistic concurrency conflicts.
//!
//! Two entry points cover the two ways a hot entity gets contended:
//!
//! - [`AsyncCommandExecutor::execute_with_retry`] rebuilds a command from a
//!   factory and re-runs it through the full pipeline after refreshing the
//!   contended entities, when the durable write reports a version conflict.
//! - [`update_with_retry`] is a load, mutate, compare-and-save loop directly
//!   on a [`Repository`], holding no in-process lock. Hundreds of writers can
//!   update one record this way without queueing behind a lock ticket.
//!
//! Both give up with `ContentionExhausted` after the configured number of
//! consecutive conflicts. Any other failure ends the loop immediately.

use crate::command::{Command, ExecutionResult};
use crate::config::{ConflictRetryConfig, MaxConflictAttempts};
use crate::entity::Entity;
use crate::errors::{CommandResult, ExecutionError, RepositoryError};
use crate::executor::AsyncCommandExecutor;
use crate::repository::{PersistedRecord, Repository};
use crate::store::CommitToken;
use crate::types::{EntityId, EntityVersion};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Delay before retry number `attempt`, with ±25% jitter when enabled.
pub fn retry_delay(config: &ConflictRetryConfig, attempt: u32) -> Duration {
    let delay = config.backoff(attempt);
    if !config.jitter || delay.is_zero() {
        return delay;
    }
    let factor: f64 = rand::rng().random_range(0.75..=1.25);
    let capped = config.max_delay.as_duration().as_secs_f64();
    Duration::from_secs_f64((delay.as_secs_f64() * factor).min(capped))
}

impl AsyncCommandExecutor {
    /// Executes a command built by `factory`, retrying on version conflicts.
    ///
    /// Each attempt builds a fresh command and runs it against freshly
    /// reloaded state. The first attempt without a conflict returns its
    /// result; after `max_attempts` consecutive conflicts the result is
    /// `ContentionExhausted`.
    #[instrument(name = "executor.execute_with_retry", skip_all, fields(max_attempts = max_attempts.into_inner()))]
    pub async fn execute_with_retry<C, F>(&self, factory: F, max_attempts: MaxConflictAttempts) -> ExecutionResult
    where
        C: Command,
        F: Fn() -> C,
    {
        let max_attempts = max_attempts.into_inner();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let command = factory();
            let result = self.execute(&command).await;

            let contended = match &result.error {
                Some(ExecutionError::VersionConflict { ids }) => ids.clone(),
                _ => {
                    if attempt > 1 {
                        debug!(attempt, success = result.success, "[executor.execute_with_retry] settled after retries");
                    }
                    return result;
                }
            };

            if attempt >= max_attempts {
                warn!(attempt, "[executor.execute_with_retry] contention exhausted");
                return ExecutionResult::failed(ExecutionError::ContentionExhausted {
                    attempts: attempt,
                    ids: contended,
                });
            }

            if let Err(failure) = self.store.refresh(&contended, CommitToken::new()).await {
                return ExecutionResult::failed(failure.into());
            }
            let delay = retry_delay(&self.retry, attempt);
            warn!(attempt, delay_ms = delay.as_millis(), "[executor.execute_with_retry] version conflict, retrying");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// [`AsyncCommandExecutor::execute_with_retry`] with the configured attempt budget.
    pub async fn execute_with_default_retry<C, F>(&self, factory: F) -> ExecutionResult
    where
        C: Command,
        F: Fn() -> C,
    {
        self.execute_with_retry(factory, self.retry.max_attempts).await
    }
}

/// Result of a successful [`update_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct CasOutcome<T> {
    /// What the mutation returned on the winning attempt
    pub value: T,
    /// The entity as saved
    pub entity: Entity,
    /// Stored version after the save
    pub version: EntityVersion,
    /// Conflicts lost before the save went through
    pub retries: u32,
}

/// Loads `id`, applies `mutate` and saves it conditionally, retrying on
/// version conflicts.
///
/// `mutate` runs once per attempt against the freshly loaded entity and may
/// reject the update with a `CommandError`, which ends the loop.
#[instrument(name = "repository.update_with_retry", skip(repository, config, mutate), fields(entity = %id))]
pub async fn update_with_retry<R, F, T>(
    repository: &R,
    id: &EntityId,
    config: &ConflictRetryConfig,
    mut mutate: F,
) -> Result<CasOutcome<T>, ExecutionError>
where
    R: Repository + ?Sized,
    F: FnMut(&mut Entity) -> CommandResult<T>,
{
    let max_attempts = config.max_attempts.into_inner();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(PersistedRecord { mut entity, version }) = repository.load(id).await? else {
            return Err(ExecutionError::EntityNotFound(id.clone()));
        };

        let value = mutate(&mut entity)?;

        match repository.save(id, &PersistedRecord::new(entity.clone(), version)).await {
            Ok(version) => {
                return Ok(CasOutcome {
                    value,
                    entity,
                    version,
                    retries: attempt - 1,
                });
            }
            Err(RepositoryError::VersionConflict { .. }) if attempt < max_attempts => {
                let delay = retry_delay(config, attempt);
                debug!(attempt, delay_ms = delay.as_millis(), "[repository.update_with_retry] version conflict, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(RepositoryError::VersionConflict { .. }) => {
                warn!(attempt, "[repository.update_with_retry] contention exhausted");
                return Err(ExecutionError::ContentionExhausted {
                    attempts: attempt,
                    ids: vec![id.clone()],
                });
            }
            Err(other) => return Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryBaseDelayMs, RetryMaxDelayMs};
    use crate::entity::Payload;
    use crate::errors::{CommandError, RepositoryResult};
    use crate::store::{ChangeSet, EntityStore, MemoryEntityStore};
    use crate::transaction::Transaction;
    use crate::types::EntityKind;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    proptest! {
        #[test]
        fn jittered_delay_stays_within_a_quarter_of_the_backoff(attempt in 1u32..8) {
            let config = ConflictRetryConfig {
                base_delay: RetryBaseDelayMs::try_new(100).unwrap(),
                max_delay: RetryMaxDelayMs::try_new(300_000).unwrap(),
                ..ConflictRetryConfig::default()
            };
            let base = config.backoff(attempt).as_secs_f64();
            let delay = retry_delay(&config, attempt).as_secs_f64();
            prop_assert!(delay >= base * 0.75 - 1e-9);
            prop_assert!(delay <= base * 1.25 + 1e-9);
        }

        #[test]
        fn jitter_never_exceeds_the_cap(attempt in 1u32..40) {
            let config = ConflictRetryConfig::default();
            prop_assert!(retry_delay(&config, attempt) <= config.max_delay.as_duration());
        }
    }

    /// Memory store whose durable write loses the first `conflicts` races.
    struct Contested {
        inner: MemoryEntityStore,
        conflicts: AtomicU32,
        refreshed: AtomicU32,
    }

    impl Contested {
        fn new(conflicts: u32) -> Self {
            let mut inner = MemoryEntityStore::new();
            inner.set(id("boss"), Entity::new(EntityKind::try_new("boss").unwrap()).with("hp", 100));
            Self {
                inner,
                conflicts: AtomicU32::new(conflicts),
                refreshed: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EntityStore for Contested {
        fn get(&self, id: &EntityId) -> Option<Arc<Entity>> {
            self.inner.get(id)
        }

        fn set(&mut self, id: EntityId, entity: Entity) {
            self.inner.set(id, entity);
        }

        fn delete(&mut self, id: &EntityId) -> bool {
            self.inner.delete(id)
        }

        fn list_by_kind(&self, kind: &EntityKind) -> Vec<(EntityId, Arc<Entity>)> {
            self.inner.list_by_kind(kind)
        }

        fn count(&self) -> usize {
            self.inner.count()
        }

        fn apply(&self, changes: &ChangeSet, token: CommitToken) {
            self.inner.apply(changes, token);
        }

        async fn persist(&self, changes: &ChangeSet, _token: CommitToken) -> RepositoryResult<()> {
            let lost = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            match changes.ids().into_iter().next() {
                Some(id) if lost => Err(RepositoryError::VersionConflict {
                    id,
                    expected: EntityVersion::initial(),
                    current: EntityVersion::initial().next(),
                }),
                _ => Ok(()),
            }
        }

        async fn refresh(&self, _ids: &[EntityId], _token: CommitToken) -> RepositoryResult<()> {
            self.refreshed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Hit {
        damage: i64,
    }

    impl Command for Hit {
        fn dependencies(&self) -> Vec<EntityId> {
            vec![id("boss")]
        }

        fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
            let boss = txn.require_mut(&id("boss"))?;
            let hp = boss.get_i64("hp").unwrap_or(0);
            if hp < self.damage {
                return Err(CommandError::validation("Boss already down"));
            }
            boss.set("hp", hp - self.damage);
            Ok(Payload::new())
        }
    }

    fn id(s: &str) -> EntityId {
        EntityId::try_new(s).unwrap()
    }

    fn attempts(n: u32) -> MaxConflictAttempts {
        MaxConflictAttempts::try_new(n).unwrap()
    }

    fn executor(store: Arc<Contested>) -> AsyncCommandExecutor {
        AsyncCommandExecutor::new(store).with_retry_config(ConflictRetryConfig::immediate(attempts(5)))
    }

    #[tokio::test]
    async fn conflicts_below_the_budget_are_absorbed() {
        let store = Arc::new(Contested::new(2));
        let result = executor(Arc::clone(&store))
            .execute_with_retry(|| Hit { damage: 10 }, attempts(3))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(store.get(&id("boss")).unwrap().get_i64("hp"), Some(90));
        assert_eq!(store.refreshed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_contention() {
        let store = Arc::new(Contested::new(10));
        let result = executor(Arc::clone(&store))
            .execute_with_retry(|| Hit { damage: 10 }, attempts(3))
            .await;

        assert_eq!(
            result.error,
            Some(ExecutionError::ContentionExhausted {
                attempts: 3,
                ids: vec![id("boss")],
            })
        );
        assert_eq!(store.get(&id("boss")).unwrap().get_i64("hp"), Some(100));
    }

    #[tokio::test]
    async fn business_failures_are_not_retried() {
        let store = Arc::new(Contested::new(0));
        let built = AtomicU32::new(0);
        let result = executor(Arc::clone(&store))
            .execute_with_retry(
                || {
                    built.fetch_add(1, Ordering::SeqCst);
                    Hit { damage: 500 }
                },
                attempts(5),
            )
            .await;

        assert!(matches!(result.error, Some(ExecutionError::ValidationFailure(_))));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn default_budget_comes_from_the_retry_config() {
        let store = Arc::new(Contested::new(10));
        let result = executor(store)
            .execute_with_default_retry(|| Hit { damage: 1 })
            .await;
        assert!(matches!(
            result.error,
            Some(ExecutionError::ContentionExhausted { attempts: 5, .. })
        ));
    }

    #[test]
    fn delays_are_exact_without_jitter() {
        let config = ConflictRetryConfig {
            jitter: false,
            ..ConflictRetryConfig::default()
        };
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(50));
        assert_eq!(retry_delay(&config, 2), Duration::from_millis(100));
    }
}

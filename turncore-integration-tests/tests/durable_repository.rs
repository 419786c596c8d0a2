//! Optimistic versioning and bulk loading, checked against every backend.
//!
//! Each scenario is written once against `&dyn Repository` and run for the
//! in-memory repository and for SQLite.

mod common;

use std::sync::Arc;

use common::{id, ids, init_tracing};
use turncore::config::{BackoffMultiplier, MaxConflictAttempts, RetryBaseDelayMs, RetryMaxDelayMs};
use turncore::repository::{PersistedRecord, Repository, WriteBatch};
use turncore::retry::update_with_retry;
use turncore::types::{EntityId, EntityVersion};
use turncore::{ConflictRetryConfig, Entity, ExecutionError, RepositoryError};
use turncore_memory::InMemoryRepository;
use turncore_sqlite::SqliteRepository;
use turncore_testing::fixtures::{boss, player};

async fn sqlite() -> SqliteRepository {
    SqliteRepository::in_memory()
        .await
        .expect("in-memory SQLite opens")
}

/// Saves `entity` under `id` repeatedly until it sits at `version`.
async fn seed_at_version(repository: &dyn Repository, id: &EntityId, entity: &Entity, version: u64) {
    let mut current = EntityVersion::initial();
    while current.into_inner() < version {
        current = repository
            .save(id, &PersistedRecord::new(entity.clone(), current))
            .await
            .expect("seeding write succeeds");
    }
}

async fn second_writer_on_the_same_version_conflicts(repository: &dyn Repository) {
    // Given: boss is stored at version 5
    let boss_id = id("boss");
    seed_at_version(repository, &boss_id, &boss(1_000), 5).await;

    // And: two writers both loaded version 5
    let first = repository.load(&boss_id).await.unwrap().expect("boss exists");
    let second = first.clone();
    assert_eq!(first.version, EntityVersion::new(5));

    // When: writer A saves, then writer B saves
    let mut a = first.entity;
    a.set("hp", 900);
    let saved = repository.save(&boss_id, &PersistedRecord::new(a, first.version)).await;

    let mut b = second.entity;
    b.set("hp", 950);
    let lost = repository.save(&boss_id, &PersistedRecord::new(b, second.version)).await;

    // Then: A advanced the version and B lost the race
    assert_eq!(saved, Ok(EntityVersion::new(6)));
    assert_eq!(
        lost,
        Err(RepositoryError::VersionConflict {
            id: boss_id.clone(),
            expected: EntityVersion::new(5),
            current: EntityVersion::new(6),
        })
    );
    let stored = repository.load(&boss_id).await.unwrap().expect("boss exists");
    assert_eq!(stored.entity.get_i64("hp"), Some(900));
}

async fn bulk_load_omits_missing_ids(repository: &dyn Repository) {
    // Given: x1..x25 exist
    let mut batch = WriteBatch::new();
    for n in 1..=25 {
        batch.save(id(&format!("x{n}")), player(n), EntityVersion::initial());
    }
    repository.commit_batch(batch).await.expect("seed batch commits");

    // When: x1..x30 are requested
    let requested: Vec<EntityId> = (1..=30).map(|n| id(&format!("x{n}"))).collect();
    let loaded = repository.load_bulk(&requested).await.expect("bulk load succeeds");

    // Then: exactly the 25 stored ids come back, each at version 1
    assert_eq!(loaded.len(), 25);
    assert!(!loaded.contains_key(&id("x26")));
    assert_eq!(loaded[&id("x7")].entity.get_i64("gold"), Some(7));
    assert!(loaded.values().all(|record| record.version == EntityVersion::new(1)));
}

async fn batch_with_one_stale_write_changes_nothing(repository: &dyn Repository) {
    seed_at_version(repository, &id("a"), &player(10), 1).await;
    seed_at_version(repository, &id("b"), &player(10), 2).await;

    let mut batch = WriteBatch::new();
    batch
        .save(id("a"), player(0), EntityVersion::new(1))
        .save(id("b"), player(0), EntityVersion::new(1));
    let result = repository.commit_batch(batch).await;

    assert!(result.unwrap_err().is_version_conflict());
    let loaded = repository.load_bulk(&ids(&["a", "b"])).await.unwrap();
    assert_eq!(loaded[&id("a")].entity.get_i64("gold"), Some(10));
    assert_eq!(loaded[&id("a")].version, EntityVersion::new(1));
    assert_eq!(loaded[&id("b")].version, EntityVersion::new(2));
}

fn contention_config() -> ConflictRetryConfig {
    ConflictRetryConfig {
        max_attempts: MaxConflictAttempts::try_new(1_000).unwrap(),
        base_delay: RetryBaseDelayMs::try_new(1).unwrap(),
        max_delay: RetryMaxDelayMs::try_new(10).unwrap(),
        backoff_multiplier: BackoffMultiplier::try_new(1.5).unwrap(),
        jitter: true,
    }
}

async fn hundreds_of_writers_share_one_boss<R>(repository: Arc<R>)
where
    R: Repository + 'static,
{
    const WRITERS: i64 = 200;

    // Given: a boss with 1000 hp
    let boss_id = id("raid_boss");
    repository
        .save(&boss_id, &PersistedRecord::fresh(boss(1_000)))
        .await
        .expect("boss is created");

    // When: 200 tasks each land one point of damage through compare-and-increment
    let config = contention_config();
    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let repository = repository.clone();
            let boss_id = boss_id.clone();
            tokio::spawn(async move {
                update_with_retry(repository.as_ref(), &boss_id, &config, |entity| {
                    let hp = entity.get_i64("hp").unwrap_or(0);
                    entity.set("hp", hp - 1);
                    Ok(hp - 1)
                })
                .await
            })
        })
        .collect();

    let mut remaining_hp = Vec::with_capacity(handles.len());
    for handle in handles {
        let outcome = handle.await.expect("writer task joins").expect("writer succeeds");
        remaining_hp.push(outcome.value);
    }

    // Then: no hit was lost and every writer saw a distinct value
    let stored = repository.load(&boss_id).await.unwrap().expect("boss exists");
    assert_eq!(stored.entity.get_i64("hp"), Some(1_000 - WRITERS));
    assert_eq!(stored.version, EntityVersion::new(201));
    remaining_hp.sort_unstable();
    remaining_hp.dedup();
    assert_eq!(remaining_hp.len(), 200);
}

#[tokio::test]
async fn memory_second_writer_on_the_same_version_conflicts() {
    init_tracing();
    second_writer_on_the_same_version_conflicts(&InMemoryRepository::new()).await;
}

#[tokio::test]
async fn sqlite_second_writer_on_the_same_version_conflicts() {
    init_tracing();
    second_writer_on_the_same_version_conflicts(&sqlite().await).await;
}

#[tokio::test]
async fn memory_bulk_load_omits_missing_ids() {
    bulk_load_omits_missing_ids(&InMemoryRepository::new()).await;
}

#[tokio::test]
async fn sqlite_bulk_load_omits_missing_ids() {
    bulk_load_omits_missing_ids(&sqlite().await).await;
}

#[tokio::test]
async fn memory_batch_with_one_stale_write_changes_nothing() {
    batch_with_one_stale_write_changes_nothing(&InMemoryRepository::new()).await;
}

#[tokio::test]
async fn sqlite_batch_with_one_stale_write_changes_nothing() {
    batch_with_one_stale_write_changes_nothing(&sqlite().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_hundreds_of_writers_share_one_boss() {
    hundreds_of_writers_share_one_boss(Arc::new(InMemoryRepository::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_hundreds_of_writers_share_one_boss() {
    hundreds_of_writers_share_one_boss(Arc::new(sqlite().await)).await;
}

#[tokio::test]
async fn cas_update_of_a_missing_entity_is_not_found() {
    let repository = InMemoryRepository::new();
    let result = update_with_retry(&repository, &id("ghost"), &contention_config(), |_| Ok(())).await;
    assert_eq!(result.unwrap_err(), ExecutionError::EntityNotFound(id("ghost")));
}

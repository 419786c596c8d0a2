//! Batched versus per-id loading from SQLite

#![allow(missing_docs)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use tokio::runtime::Runtime;
use turncore::entity::Entity;
use turncore::repository::{Repository, WriteBatch};
use turncore::types::{EntityId, EntityKind, EntityVersion};
use turncore_sqlite::SqliteRepository;

fn seeded(runtime: &Runtime, count: usize) -> (SqliteRepository, Vec<EntityId>) {
    runtime.block_on(async {
        let repository = SqliteRepository::in_memory()
            .await
            .expect("in-memory database opens");
        let kind = EntityKind::try_new("player").expect("valid kind");
        let ids: Vec<EntityId> = (0..count)
            .map(|n| EntityId::try_new(format!("player_{n:05}")).expect("valid id"))
            .collect();

        let mut batch = WriteBatch::new();
        for (n, id) in ids.iter().enumerate() {
            let entity = Entity::new(kind.clone()).with("gold", n).with("level", 1);
            batch.save(id.clone(), entity, EntityVersion::initial());
        }
        repository.commit_batch(batch).await.expect("seed batch commits");
        (repository, ids)
    })
}

fn bench_load_strategies(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("sqlite_load");

    for count in [10, 100, 1_000] {
        let (repository, ids) = seeded(&runtime, count);

        group.bench_with_input(BenchmarkId::new("load_bulk", count), &ids, |b, ids| {
            b.to_async(&runtime)
                .iter(|| async { black_box(repository.load_bulk(ids).await.expect("bulk load")) });
        });

        group.bench_with_input(BenchmarkId::new("load_each", count), &ids, |b, ids| {
            b.to_async(&runtime).iter(|| async {
                for id in ids {
                    black_box(repository.load(id).await.expect("single load"));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_load_strategies);
criterion_main!(benches);

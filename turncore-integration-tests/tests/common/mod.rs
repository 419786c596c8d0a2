//! Helpers shared by the integration test binaries.

#![allow(dead_code)]

use std::sync::Arc;

use turncore::store::{EntityStore, MemoryEntityStore};
use turncore::types::EntityId;
use turncore::{AsyncCommandExecutor, Entity};

/// Installs a `RUST_LOG`-driven subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn id(s: &str) -> EntityId {
    EntityId::try_new(s).expect("test ids are valid")
}

pub fn ids(names: &[&str]) -> Vec<EntityId> {
    names.iter().map(|name| id(name)).collect()
}

pub fn memory_store(entities: Vec<(&str, Entity)>) -> Arc<MemoryEntityStore> {
    Arc::new(entities.into_iter().map(|(name, entity)| (id(name), entity)).collect())
}

pub fn executor_over(store: Arc<MemoryEntityStore>) -> AsyncCommandExecutor {
    AsyncCommandExecutor::new(store)
}

pub fn gold(store: &dyn EntityStore, who: &str) -> i64 {
    store
        .get(&id(who))
        .and_then(|entity| entity.get_i64("gold"))
        .expect("player has gold")
}

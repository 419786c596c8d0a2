//! `turncore` - Transactional command execution for turn-based game backends
//!
//! Game logic is written as commands. Each command declares the entities it
//! touches, runs inside a copy-on-write transaction over the shared entity
//! store, and either commits all of its changes or none of them. The
//! concurrent executor serializes commands whose dependencies overlap by
//! acquiring per-entity locks in sorted order, so commands on disjoint
//! entities run in parallel without deadlocking.
//!
//! Durability is optional: [`persistent::PersistentEntityStore`] puts a
//! version-checked [`repository::Repository`] behind the store, and
//! [`retry`] turns lost optimistic races into bounded retries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod command;
pub mod config;
pub mod entity;
pub mod errors;
pub mod executor;
pub mod lock;
pub mod persistent;
pub mod repository;
pub mod retry;
pub mod saga;
pub mod store;
pub mod transaction;
pub mod types;

pub use bus::{Event, EventKind, NotificationBus, PublishReport};
pub use command::{Command, ExecutionResult};
pub use config::{BusConfig, ConflictRetryConfig, ExecutorConfig, FlushPolicy};
pub use entity::{Entity, Payload};
pub use errors::{CommandError, CommandResult, ExecutionError, RepositoryError, RepositoryResult};
pub use executor::{AsyncCommandExecutor, CommandExecutor};
pub use lock::{LockManager, LockTicket};
pub use persistent::PersistentEntityStore;
pub use repository::{PersistedRecord, Repository, WriteBatch};
pub use retry::update_with_retry;
pub use saga::{Saga, SagaOutcome, SagaStatus};
pub use store::{ChangeSet, EntityStore, MemoryEntityStore};
pub use transaction::Transaction;
pub use types::{EntityId, EntityKind, EntityVersion, ExecutionId};

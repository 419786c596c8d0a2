//! Command execution pipeline.
//!
//! Both executors run the same pipeline:
//!
//! 1. resolve the command's dependencies
//! 2. (concurrent only) acquire a lock ticket over them
//! 3. hydrate the dependencies into the store
//! 4. open a transaction and run the command
//! 5. on failure roll back; on success persist, then commit
//! 6. release the ticket and publish the committed events
//!
//! Every execution ends in exactly one [`ExecutionResult`]. Business
//! failures, storage failures and panics inside a command are all turned
//! into a failed result with nothing committed; none propagate to the caller.

use crate::bus::{panic_message, Event, NotificationBus};
use crate::command::{Command, ExecutionResult};
use crate::config::{ConflictRetryConfig, ExecutorConfig};
use crate::entity::Payload;
use crate::errors::{CommandError, ExecutionError};
use crate::lock::{LockManager, LockStats};
use crate::store::{CommitToken, EntityStore};
use crate::transaction::Transaction;
use crate::types::{EntityId, ExecutionId};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Runs steps 3 to 5 of the pipeline; the caller holds any locks.
async fn run_in_transaction<C>(
    store: &dyn EntityStore,
    command: &C,
    dependencies: &[EntityId],
) -> Result<(Payload, Vec<Event>), ExecutionError>
where
    C: Command + ?Sized,
{
    store.hydrate(dependencies).await?;

    let mut txn = Transaction::open(store);
    let outcome = catch_unwind(AssertUnwindSafe(|| command.execute(&mut txn)));
    let payload = match outcome {
        Ok(Ok(payload)) => payload,
        Ok(Err(failure)) => {
            discard(&mut txn);
            log_command_failure(&failure);
            return Err(failure.into());
        }
        Err(panic) => {
            discard(&mut txn);
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "[executor.execute] command panicked, transaction rolled back");
            return Err(ExecutionError::Internal(format!("command panicked: {message}")));
        }
    };

    audit_dependencies(&txn, dependencies);

    let pending = txn.pending_changes();
    if txn.is_active() && !pending.is_empty() {
        if let Err(failure) = store.persist(&pending, CommitToken::new()).await {
            discard(&mut txn);
            if failure.is_version_conflict() {
                warn!(error = %failure, "[executor.persist] version conflict, transaction rolled back");
            } else {
                error!(error = %failure, "[executor.persist] repository write failed, transaction rolled back");
            }
            return Err(failure.into());
        }
    }

    match txn.commit() {
        Ok(committed) => {
            debug!(changed = committed.ids().len(), "[executor.commit] transaction committed");
            Ok((payload, committed.into_events()))
        }
        Err(misuse) => {
            error!(error = %misuse, "[executor.commit] command finalized its own transaction");
            Err(misuse.into())
        }
    }
}

fn discard(txn: &mut Transaction<'_>) {
    if txn.is_active() {
        // Rollback of an open transaction cannot fail.
        let _ = txn.rollback();
    }
}

fn log_command_failure(failure: &CommandError) {
    match failure {
        CommandError::ValidationFailure(_) | CommandError::EntityNotFound(_) => {
            debug!(error = %failure, "[executor.execute] command rejected, transaction rolled back");
        }
        CommandError::Transaction(_) | CommandError::Internal(_) => {
            error!(error = %failure, "[executor.execute] command failed, transaction rolled back");
        }
    }
}

fn audit_dependencies(txn: &Transaction<'_>, dependencies: &[EntityId]) {
    let declared: BTreeSet<&EntityId> = dependencies.iter().collect();
    let undeclared: Vec<String> = txn
        .touched_ids()
        .into_iter()
        .filter(|id| !declared.contains(&id))
        .map(|id| id.to_string())
        .collect();
    if !undeclared.is_empty() {
        error!(undeclared = ?undeclared, "[executor.execute] command touched entities it did not declare");
    }
}

fn publish(bus: Option<&NotificationBus>, events: &[Event]) {
    if let Some(bus) = bus {
        for event in events {
            bus.publish(event);
        }
    }
}

/// Serial executor for single-threaded callers.
///
/// Taking `&mut self` to execute guarantees executions never overlap, so no
/// lock manager is involved.
#[derive(Debug)]
pub struct CommandExecutor<S> {
    store: S,
    bus: Option<Arc<NotificationBus>>,
}

impl<S: EntityStore> CommandExecutor<S> {
    /// An executor owning `store`.
    pub const fn new(store: S) -> Self {
        Self { store, bus: None }
    }

    /// Publishes committed events to `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// The executor's store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Direct access to the store, e.g. for seeding.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Gives the store back.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Executes one command.
    #[instrument(
        name = "executor.execute_serial",
        skip_all,
        fields(command = command.name(), execution_id = %ExecutionId::generate())
    )]
    pub async fn execute<C>(&mut self, command: &C) -> ExecutionResult
    where
        C: Command + ?Sized,
    {
        let dependencies = command.dependencies();
        match run_in_transaction(&self.store, command, &dependencies).await {
            Ok((payload, events)) => {
                publish(self.bus.as_deref(), &events);
                ExecutionResult::succeeded(payload)
            }
            Err(failure) => ExecutionResult::failed(failure),
        }
    }
}

/// Concurrent executor.
///
/// Cheap to clone; clones share the store, lock manager and bus. Commands
/// sharing at least one declared id run one after the other; commands with
/// disjoint dependencies may interleave freely.
#[derive(Clone)]
pub struct AsyncCommandExecutor {
    pub(crate) store: Arc<dyn EntityStore>,
    locks: LockManager,
    bus: Option<Arc<NotificationBus>>,
    config: ExecutorConfig,
    pub(crate) retry: ConflictRetryConfig,
}

impl std::fmt::Debug for AsyncCommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCommandExecutor")
            .field("locks", &self.locks.stats())
            .field("bus", &self.bus)
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl AsyncCommandExecutor {
    /// An executor over a shared store with default configuration.
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            locks: LockManager::new(),
            bus: None,
            config: ExecutorConfig::default(),
            retry: ConflictRetryConfig::default(),
        }
    }

    /// Publishes committed events to `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replaces the executor configuration.
    #[must_use]
    pub const fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the conflict retry configuration.
    #[must_use]
    pub const fn with_retry_config(mut self, retry: ConflictRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Shares an existing lock manager, e.g. between executors over one store.
    #[must_use]
    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// The lock manager guarding the store.
    pub const fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// The attached bus, if any.
    pub fn bus(&self) -> Option<&Arc<NotificationBus>> {
        self.bus.as_ref()
    }

    /// Lock registry statistics.
    pub fn lock_stats(&self) -> LockStats {
        self.locks.stats()
    }

    /// Executes one command with the configured lock timeout.
    pub async fn execute<C>(&self, command: &C) -> ExecutionResult
    where
        C: Command + ?Sized,
    {
        self.execute_with_timeout(command, self.config.lock_timeout.as_duration())
            .await
    }

    /// Executes one command, waiting at most `timeout` for its locks.
    #[instrument(
        name = "executor.execute",
        skip_all,
        fields(command = command.name(), execution_id = %ExecutionId::generate())
    )]
    pub async fn execute_with_timeout<C>(&self, command: &C, timeout: Duration) -> ExecutionResult
    where
        C: Command + ?Sized,
    {
        let dependencies = command.dependencies();
        let mut ticket = match self.locks.acquire(dependencies.iter().cloned(), timeout).await {
            Ok(ticket) => ticket,
            Err(timed_out) => return ExecutionResult::failed(timed_out.into()),
        };

        let outcome = run_in_transaction(self.store.as_ref(), command, &dependencies).await;
        ticket.release();

        match outcome {
            Ok((payload, events)) => {
                publish(self.bus.as_deref(), &events);
                ExecutionResult::succeeded(payload)
            }
            Err(failure) => ExecutionResult::failed(failure),
        }
    }

    /// Executes commands concurrently on the current task.
    ///
    /// Results are returned in submission order.
    pub async fn execute_batch<C>(&self, commands: &[C]) -> Vec<ExecutionResult>
    where
        C: Command,
    {
        join_all(commands.iter().map(|command| self.execute(command))).await
    }

    /// Executes commands on separate tasks of the runtime.
    ///
    /// Results are returned in submission order.
    pub async fn execute_parallel<C>(&self, commands: Vec<C>) -> Vec<ExecutionResult>
    where
        C: Command + 'static,
    {
        let handles: Vec<_> = commands
            .into_iter()
            .map(|command| {
                let executor = self.clone();
                tokio::spawn(async move { executor.execute(&command).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|join_error| {
                error!(error = %join_error, "[executor.execute_parallel] task failed");
                ExecutionResult::failed(ExecutionError::Internal(format!(
                    "execution task failed: {join_error}"
                )))
            }));
        }
        results
    }
}

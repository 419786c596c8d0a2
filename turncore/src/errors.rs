//! Error types for TurnCore.
//!
//! Each subsystem has its own error enum so that callers can tell business
//! rule violations apart from contention and from defects:
//!
//! - **CommandError**: raised by command logic inside a transaction
//! - **TransactionError**: misuse of a finalized transaction (a defect)
//! - **LockError**: bounded wait on the lock manager exceeded
//! - **RepositoryError**: durable storage failures and version conflicts
//! - **ExecutionError**: what an execution result reports to its caller
//!
//! Every execution ends in exactly one [`ExecutionResult`](crate::command::ExecutionResult);
//! `ExecutionError` is the failure half of it.

use crate::transaction::TransactionState;
use crate::types::{EntityId, EntityVersion};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a command's transformation.
///
/// `ValidationFailure` and `EntityNotFound` are ordinary business outcomes;
/// the executor turns them into a failed result without logging them as
/// defects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The command rejected its own inputs (e.g. insufficient gold).
    #[error("Validation error: {0}")]
    ValidationFailure(String),

    /// A referenced entity does not exist.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// The command used a transaction after it was finalized.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailure(message.into())
    }
}

/// Misuse of a transaction's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// Commit, rollback or access was attempted after finalization.
    #[error("Transaction already {state}")]
    AlreadyFinalized {
        /// Terminal state the transaction is in
        state: TransactionState,
    },
}

/// Errors from the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock ticket could not be granted within the timeout budget.
    #[error("Timed out after {timeout:?} waiting for lock on '{blocked_on}'")]
    Timeout {
        /// Every id the ticket requested, in acquisition order
        ids: Vec<EntityId>,
        /// The id whose lock could not be obtained
        blocked_on: EntityId,
        /// The total budget that was exceeded
        timeout: Duration,
    },
}

/// Errors from a durable repository.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// Optimistic concurrency check failed: another writer advanced the version.
    #[error("Version conflict on entity '{id}': expected {expected}, but current is {current}")]
    VersionConflict {
        /// The contended entity
        id: EntityId,
        /// The version the writer last observed
        expected: EntityVersion,
        /// The version currently stored (0 when absent)
        current: EntityVersion,
    },

    /// The storage backend failed.
    #[error("Repository operation '{operation}' failed: {detail}")]
    StoreFailure {
        /// The operation that failed
        operation: String,
        /// Backend-specific description
        detail: String,
    },

    /// An entity could not be encoded for storage.
    #[error("Failed to serialize entity '{id}': {detail}")]
    Serialization {
        /// The entity being written
        id: EntityId,
        /// Encoder message
        detail: String,
    },

    /// A stored document could not be decoded.
    #[error("Failed to deserialize entity '{id}': {detail}")]
    Deserialization {
        /// The entity being read
        id: EntityId,
        /// Decoder message
        detail: String,
    },
}

impl RepositoryError {
    /// Builds a `StoreFailure` from any displayable backend error.
    pub fn store_failure(operation: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::StoreFailure {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }

    /// True for optimistic concurrency failures.
    pub const fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// The failure carried by an unsuccessful execution result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The command rejected its inputs.
    #[error("Validation error: {0}")]
    ValidationFailure(String),

    /// A referenced entity does not exist.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// The lock ticket could not be granted in time. Retryable.
    #[error("Lock timeout: {0}")]
    LockTimeout(#[from] LockError),

    /// A transaction was used after finalization. A defect, never retried.
    #[error("Transaction misuse: {0}")]
    AlreadyFinalized(TransactionError),

    /// An optimistic write lost a race. Retryable.
    #[error("Version conflict on {}", join_ids(.ids))]
    VersionConflict {
        /// Entities whose stored version moved
        ids: Vec<EntityId>,
    },

    /// The retry budget ran out under sustained contention.
    #[error("Contention exhausted after {attempts} attempts on {}", join_ids(.ids))]
    ContentionExhausted {
        /// Attempts made, all of which conflicted
        attempts: u32,
        /// Entities contended on the final attempt
        ids: Vec<EntityId>,
    },

    /// The durable repository failed for a reason other than a conflict.
    #[error("Repository error: {0}")]
    Repository(String),

    /// The command panicked or violated an internal invariant.
    #[error("Unexpected error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Conditions a caller may legitimately retry.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::VersionConflict { .. })
    }

    /// Conditions that indicate a programming defect.
    pub const fn is_defect(&self) -> bool {
        matches!(self, Self::AlreadyFinalized(_) | Self::Internal(_))
    }

    /// Ids involved in a version conflict, empty for every other error.
    pub fn conflicting_ids(&self) -> &[EntityId] {
        match self {
            Self::VersionConflict { ids } | Self::ContentionExhausted { ids, .. } => ids,
            _ => &[],
        }
    }
}

impl From<CommandError> for ExecutionError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::ValidationFailure(message) => Self::ValidationFailure(message),
            CommandError::EntityNotFound(id) => Self::EntityNotFound(id),
            CommandError::Transaction(inner) => Self::AlreadyFinalized(inner),
            CommandError::Internal(message) => Self::Internal(message),
        }
    }
}

impl From<TransactionError> for ExecutionError {
    fn from(error: TransactionError) -> Self {
        Self::AlreadyFinalized(error)
    }
}

impl From<RepositoryError> for ExecutionError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::VersionConflict { id, .. } => Self::VersionConflict { ids: vec![id] },
            other => Self::Repository(other.to_string()),
        }
    }
}

fn join_ids(ids: &[EntityId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for command logic.
pub type CommandResult<T> = Result<T, CommandError>;

/// Result type for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Result type for lock manager operations.
pub type LockResult<T> = Result<T, LockError>;

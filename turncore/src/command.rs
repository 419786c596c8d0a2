//! Commands and execution results.
//!
//! A command is a single-use value holding its own inputs. It declares the
//! exact set of entity ids it may read or write before it runs, then
//! transforms a [`Transaction`] and returns a [`Payload`]. Touching an id
//! that was not declared is a programming error in the command; the
//! executor only locks and hydrates what is declared.
//!
//! # Example
//!
//! ```rust,ignore
//! struct GainGold { player: EntityId, amount: i64 }
//!
//! impl Command for GainGold {
//!     fn dependencies(&self) -> Vec<EntityId> {
//!         vec![self.player.clone()]
//!     }
//!
//!     fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
//!         let player = txn.require_mut(&self.player)?;
//!         let gold = player.get_i64("gold").unwrap_or(0) + self.amount;
//!         player.set("gold", gold);
//!         Ok(Payload::new())
//!     }
//! }
//! ```

use crate::entity::Payload;
use crate::errors::{CommandResult, ExecutionError};
use crate::transaction::Transaction;
use crate::types::EntityId;

/// A unit of business logic with explicit entity dependencies.
pub trait Command: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Every id the command may read or write.
    fn dependencies(&self) -> Vec<EntityId>;

    /// Transforms the transaction's working view.
    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload>;
}

impl<C: Command + ?Sized> Command for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn dependencies(&self) -> Vec<EntityId> {
        (**self).dependencies()
    }

    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
        (**self).execute(txn)
    }
}

/// Outcome of exactly one execution.
///
/// `success` implies the command's changes are committed and visible;
/// failure implies nothing was changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Whether the command committed.
    pub success: bool,
    /// The command's payload; empty on failure.
    pub data: Payload,
    /// Why the execution failed.
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    /// A committed execution.
    pub fn succeeded(data: Payload) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    /// A failed execution.
    pub fn failed(error: ExecutionError) -> Self {
        Self {
            success: false,
            data: Payload::new(),
            error: Some(error),
        }
    }

    /// Human-readable failure description.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// Converts back into a `Result`.
    pub fn into_result(self) -> Result<Payload, ExecutionError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

impl From<Result<Payload, ExecutionError>> for ExecutionResult {
    fn from(result: Result<Payload, ExecutionError>) -> Self {
        match result {
            Ok(data) => Self::succeeded(data),
            Err(error) => Self::failed(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CommandError;
    use serde_json::json;

    struct Noop;

    impl Command for Noop {
        fn dependencies(&self) -> Vec<EntityId> {
            Vec::new()
        }

        fn execute(&self, _txn: &mut Transaction<'_>) -> CommandResult<Payload> {
            Ok(Payload::new())
        }
    }

    #[test]
    fn default_name_is_the_type_name() {
        assert!(Noop.name().ends_with("Noop"));
        let boxed: Box<dyn Command> = Box::new(Noop);
        assert!(boxed.name().ends_with("Noop"));
    }

    #[test]
    fn results_round_trip_through_result() {
        let mut data = Payload::new();
        data.insert("gold".to_string(), json!(10));

        let ok = ExecutionResult::from(Ok(data.clone()));
        assert!(ok.success);
        assert_eq!(ok.error_message(), None);
        assert_eq!(ok.into_result().unwrap(), data);

        let failed = ExecutionResult::failed(CommandError::validation("Insufficient gold").into());
        assert!(!failed.success);
        assert!(failed.data.is_empty());
        assert_eq!(
            failed.error_message().as_deref(),
            Some("Validation error: Insufficient gold")
        );
    }
}

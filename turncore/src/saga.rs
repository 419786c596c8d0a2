//! Multi-step operations with compensating commands.
//!
//! A saga runs its steps one after another through an
//! [`AsyncCommandExecutor`], each step in its own transaction. When a step
//! fails, the compensations of the steps that already committed run in
//! reverse order. A step without a compensation is skipped with a warning.
//!
//! ```rust,ignore
//! let fusion = Saga::new("card_fusion")
//!     .step_with_compensation("consume_cards", RemoveCards::new(&cards), RestoreCards::new(&cards))
//!     .step("create_fused", SpawnEntity::new(fused_id, fused));
//!
//! let outcome = fusion.run(&executor).await;
//! assert!(outcome.is_success() || outcome.compensated);
//! ```

use crate::command::Command;
use crate::entity::Payload;
use crate::errors::ExecutionError;
use crate::executor::AsyncCommandExecutor;
use crate::types::ExecutionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, instrument, warn};

/// Where a saga run currently is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Not started
    Pending,
    /// Running steps
    Executing,
    /// Every step committed
    Completed,
    /// Undoing committed steps after a failure
    Compensating,
    /// A step failed; see the outcome for whether compensation succeeded
    Failed,
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Compensating => "compensating",
            Self::Failed => "failed",
        };
        f.write_str(status)
    }
}

struct SagaStep {
    name: String,
    action: Box<dyn Command>,
    compensation: Option<Box<dyn Command>>,
}

/// An ordered list of named steps.
pub struct Saga {
    name: String,
    steps: Vec<SagaStep>,
}

impl fmt::Debug for Saga {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<&str> = self.steps.iter().map(|step| step.name.as_str()).collect();
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field("steps", &steps)
            .finish()
    }
}

/// A compensation that did not go through.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationFailure {
    /// Step whose compensation failed
    pub step: String,
    /// Why it failed
    pub error: ExecutionError,
}

/// Record of one saga run.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaOutcome {
    /// Identifies this run in logs
    pub saga_id: ExecutionId,
    /// The saga's name
    pub saga: String,
    /// Final status: `Completed` or `Failed`
    pub status: SagaStatus,
    /// Steps that committed, in order
    pub completed_steps: Vec<String>,
    /// The step that failed
    pub failed_step: Option<String>,
    /// Why it failed
    pub error: Option<ExecutionError>,
    /// True when every compensation that ran succeeded
    pub compensated: bool,
    /// Compensations that failed, in the order they ran
    pub compensation_failures: Vec<CompensationFailure>,
    /// Payload of every committed step, by step name
    pub results: BTreeMap<String, Payload>,
}

impl SagaOutcome {
    /// Whether every step committed.
    pub fn is_success(&self) -> bool {
        self.status == SagaStatus::Completed
    }

    /// A step failed and at least one compensation failed too; the game
    /// state may be inconsistent and needs attention.
    pub fn is_critical(&self) -> bool {
        self.status == SagaStatus::Failed && !self.compensated
    }

    /// Human-readable summary.
    pub fn message(&self) -> String {
        match (&self.failed_step, &self.error) {
            (Some(step), Some(error)) if self.compensated => format!(
                "Saga '{}' failed at step '{step}': {error}. Compensation completed.",
                self.saga
            ),
            (Some(step), Some(error)) => format!(
                "Saga '{}' failed at step '{step}': {error}. Compensation also failed.",
                self.saga
            ),
            _ => format!("Saga '{}' completed successfully", self.saga),
        }
    }
}

impl Saga {
    /// An empty saga.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step that cannot be undone.
    #[must_use]
    pub fn step<C>(mut self, name: impl Into<String>, action: C) -> Self
    where
        C: Command + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: Box::new(action),
            compensation: None,
        });
        self
    }

    /// Appends a step together with the command that undoes it.
    #[must_use]
    pub fn step_with_compensation<C, K>(mut self, name: impl Into<String>, action: C, compensation: K) -> Self
    where
        C: Command + 'static,
        K: Command + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: Box::new(action),
            compensation: Some(Box::new(compensation)),
        });
        self
    }

    /// The saga's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step names, in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when the saga has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step, compensating on the first failure.
    ///
    /// A saga can be run more than once; every run gets its own id.
    #[instrument(name = "saga.run", skip_all, fields(saga = %self.name, saga_id = tracing::field::Empty))]
    pub async fn run(&self, executor: &AsyncCommandExecutor) -> SagaOutcome {
        let saga_id = ExecutionId::generate();
        tracing::Span::current().record("saga_id", tracing::field::display(&saga_id));

        let mut outcome = SagaOutcome {
            saga_id,
            saga: self.name.clone(),
            status: SagaStatus::Executing,
            completed_steps: Vec::new(),
            failed_step: None,
            error: None,
            compensated: true,
            compensation_failures: Vec::new(),
            results: BTreeMap::new(),
        };
        info!(steps = self.steps.len(), "[saga.run] started");

        for (index, step) in self.steps.iter().enumerate() {
            debug!(step = %step.name, position = index + 1, "[saga.run] executing step");
            match executor.execute(step.action.as_ref()).await.into_result() {
                Ok(payload) => {
                    outcome.completed_steps.push(step.name.clone());
                    outcome.results.insert(step.name.clone(), payload);
                }
                Err(failure) => {
                    error!(step = %step.name, error = %failure, "[saga.run] step failed");
                    outcome.status = SagaStatus::Compensating;
                    outcome.failed_step = Some(step.name.clone());
                    outcome.error = Some(failure);
                    self.compensate(executor, &self.steps[..index], &mut outcome).await;
                    outcome.status = SagaStatus::Failed;
                    return outcome;
                }
            }
        }

        outcome.status = SagaStatus::Completed;
        info!("[saga.run] completed");
        outcome
    }

    async fn compensate(&self, executor: &AsyncCommandExecutor, committed: &[SagaStep], outcome: &mut SagaOutcome) {
        info!(steps = committed.len(), "[saga.compensate] started");
        for step in committed.iter().rev() {
            let Some(compensation) = &step.compensation else {
                warn!(step = %step.name, "[saga.compensate] step has no compensation");
                continue;
            };
            if let Err(failure) = executor.execute(compensation.as_ref()).await.into_result() {
                error!(step = %step.name, error = %failure, "[saga.compensate] compensation failed");
                outcome.compensation_failures.push(CompensationFailure {
                    step: step.name.clone(),
                    error: failure,
                });
            }
        }

        outcome.compensated = outcome.compensation_failures.is_empty();
        if outcome.compensated {
            info!(saga = %self.name, "[saga.compensate] completed");
        } else {
            error!(saga = %self.name, failures = outcome.compensation_failures.len(), "[saga.compensate] failed");
        }
    }
}

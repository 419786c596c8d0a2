//! Dependency declaration checks.
//!
//! The executor only locks and hydrates the ids a command declares; touching
//! anything else is a bug in the command that no lock will catch. These
//! helpers run a command in a throw-away transaction and compare what it
//! touched with what it declared.

use std::collections::BTreeSet;

use turncore::command::Command;
use turncore::errors::CommandError;
use turncore::store::EntityStore;
use turncore::transaction::Transaction;
use turncore::types::EntityId;

/// What a command declared versus what it touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyAudit {
    /// Ids returned by `dependencies()`
    pub declared: BTreeSet<EntityId>,
    /// Ids the command read or wrote, including ids it found absent
    pub touched: BTreeSet<EntityId>,
    /// Touched but not declared
    pub undeclared: BTreeSet<EntityId>,
    /// The command's own failure, if it failed
    pub failure: Option<CommandError>,
}

impl DependencyAudit {
    /// Whether every touched id was declared.
    pub fn is_clean(&self) -> bool {
        self.undeclared.is_empty()
    }
}

/// Runs `command` against `store` and rolls back, reporting what it touched.
///
/// The store is never modified.
pub fn audit_dependencies<C>(command: &C, store: &dyn EntityStore) -> DependencyAudit
where
    C: Command + ?Sized,
{
    let declared: BTreeSet<EntityId> = command.dependencies().into_iter().collect();
    let mut txn = Transaction::open(store);
    let failure = command.execute(&mut txn).err();
    let touched = txn.touched_ids();
    if txn.is_active() {
        // Rollback of an open transaction cannot fail.
        let _ = txn.rollback();
    }

    let undeclared = touched.difference(&declared).cloned().collect();
    DependencyAudit {
        declared,
        touched,
        undeclared,
        failure,
    }
}

/// Panics when `command` touches an id it did not declare.
#[track_caller]
pub fn assert_dependencies_cover<C>(command: &C, store: &dyn EntityStore)
where
    C: Command + ?Sized,
{
    let audit = audit_dependencies(command, store);
    assert!(
        audit.is_clean(),
        "command '{}' touched undeclared entities {:?} (declared {:?})",
        command.name(),
        audit.undeclared,
        audit.declared
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{player, TransferGold, UndeclaredWrite};
    use turncore::store::MemoryEntityStore;

    fn id(s: &str) -> EntityId {
        EntityId::try_new(s).unwrap()
    }

    fn store() -> MemoryEntityStore {
        [(id("p1"), player(100)), (id("p2"), player(0))].into_iter().collect()
    }

    #[test]
    fn honest_command_is_clean() {
        let store = store();
        let transfer = TransferGold::new(id("p1"), id("p2"), 10);
        assert_dependencies_cover(&transfer, &store);
        assert_eq!(store.get(&id("p2")).unwrap().get_i64("gold"), Some(0));
    }

    #[test]
    fn undeclared_write_is_reported_and_not_applied() {
        let store = store();
        let command = UndeclaredWrite::new(id("p1"), id("p2"));

        let audit = audit_dependencies(&command, &store);

        assert_eq!(audit.undeclared, BTreeSet::from([id("p2")]));
        assert!(audit.failure.is_none());
        assert_eq!(store.get(&id("p2")).unwrap().get_i64("gold"), Some(0));
    }

    #[test]
    #[should_panic(expected = "touched undeclared entities")]
    fn assertion_panics_on_undeclared_access() {
        let store = store();
        assert_dependencies_cover(&UndeclaredWrite::new(id("p1"), id("p2")), &store);
    }
}

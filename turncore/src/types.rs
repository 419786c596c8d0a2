//! Core identifier and version types.
//!
//! All types use smart constructors so that a value, once built, is valid
//! everywhere it travels. Entity identifiers in particular can never be
//! empty, which is the only input the entity store would otherwise reject.

use nutype::nutype;
use uuid::Uuid;

/// Unique key of an entity.
///
/// `EntityId` values are trimmed, non-empty and at most 255 characters.
/// Their lexicographic ordering is the global lock acquisition order.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EntityId(String);

/// Discriminator naming what an entity is (player, mob, item, ...).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EntityKind(String);

/// Version counter of a persisted entity record.
///
/// A record that has never been written has the implicit version 0.
/// Every successful write advances the stored version by exactly one.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct EntityVersion(u64);

impl EntityVersion {
    /// The implicit version of a record that does not exist yet.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Returns the version a successful write produces.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// True for the implicit version of an absent record.
    pub fn is_initial(self) -> bool {
        self.into_inner() == 0
    }
}

/// Correlates every log line emitted by one command execution.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Creates a new time-ordered execution id.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn entity_id_rejects_empty_and_whitespace() {
        assert!(EntityId::try_new("").is_err());
        assert!(EntityId::try_new("   ").is_err());
    }

    #[test]
    fn entity_id_is_trimmed() {
        let id = EntityId::try_new("  p1 ").unwrap();
        assert_eq!(id.as_ref(), "p1");
    }

    #[test]
    fn entity_id_rejects_overlong_values() {
        assert!(EntityId::try_new("x".repeat(256)).is_err());
        assert!(EntityId::try_new("x".repeat(255)).is_ok());
    }

    #[test]
    fn entity_ids_order_lexicographically() {
        let mut ids = vec![
            EntityId::try_new("b").unwrap(),
            EntityId::try_new("a10").unwrap(),
            EntityId::try_new("a2").unwrap(),
        ];
        ids.sort();
        let names: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
        assert_eq!(names, vec!["a10", "a2", "b"]);
    }

    #[test]
    fn versions_start_at_zero_and_advance_by_one() {
        let v = EntityVersion::initial();
        assert!(v.is_initial());
        assert_eq!(v.next().into_inner(), 1);
        assert_eq!(v.next().next().into_inner(), 2);
    }

    #[test]
    fn execution_ids_are_unique() {
        assert_ne!(ExecutionId::generate(), ExecutionId::generate());
    }

    proptest! {
        #[test]
        fn any_non_blank_id_round_trips_through_serde(s in "[a-z0-9_:-]{1,64}") {
            let id = EntityId::try_new(s.clone()).unwrap();
            let json = serde_json::to_string(&id).unwrap();
            let back: EntityId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back.as_ref(), s.as_str());
        }

        #[test]
        fn next_is_strictly_greater(n in 0u64..u64::MAX) {
            let v = EntityVersion::new(n);
            prop_assert!(v.next() > v);
        }
    }
}

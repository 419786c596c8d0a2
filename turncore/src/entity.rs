//! Schema-less entity documents.
//!
//! An [`Entity`] is a JSON object with a mandatory `_type` discriminator and
//! arbitrary kind-specific attributes. Relationships between entities are
//! plain attribute values holding other entities' ids; they are never
//! followed for lifetime purposes.

use crate::types::{EntityId, EntityKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute key under which the discriminator is serialized.
pub const KIND_FIELD: &str = "_type";

/// Result data returned by a command: string keys to JSON values.
pub type Payload = Map<String, Value>;

/// A mutable structured document representing one piece of game state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "_type")]
    kind: EntityKind,
    #[serde(flatten)]
    attributes: Map<String, Value>,
}

impl Entity {
    /// Creates an entity of the given kind with no attributes.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            attributes: Map::new(),
        }
    }

    /// Parses an entity from a JSON document carrying a `_type` field.
    pub fn from_document(document: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(document)
    }

    /// Renders the entity as a JSON document including the discriminator.
    pub fn to_document(&self) -> Value {
        let mut document = self.attributes.clone();
        document.insert(
            KIND_FIELD.to_string(),
            Value::String(self.kind.to_string()),
        );
        Value::Object(document)
    }

    /// The discriminator of this entity.
    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    /// All kind-specific attributes.
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// Raw attribute lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Integer attribute lookup; `None` when absent or not an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(Value::as_i64)
    }

    /// String attribute lookup.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Boolean attribute lookup.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(Value::as_bool)
    }

    /// Sets an attribute, returning the previous value.
    ///
    /// The discriminator is not an attribute; writes to `_type` are ignored.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        if key == KIND_FIELD {
            return None;
        }
        self.attributes.insert(key, value.into())
    }

    /// Builder form of [`Entity::set`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Removes an attribute.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// Ids referenced by an attribute holding either one id or a list of ids.
    ///
    /// Values that are not valid ids are skipped.
    pub fn references(&self, key: &str) -> Vec<EntityId> {
        match self.attributes.get(key) {
            Some(Value::String(id)) => EntityId::try_new(id.as_str()).into_iter().collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|id| EntityId::try_new(id).ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kind(name: &str) -> EntityKind {
        EntityKind::try_new(name).unwrap()
    }

    #[test]
    fn document_round_trip_keeps_discriminator_and_attributes() {
        let doc = json!({"_type": "player", "gold": 100, "name": "Ayla"});
        let entity = Entity::from_document(doc.clone()).unwrap();

        assert_eq!(entity.kind().as_ref(), "player");
        assert_eq!(entity.get_i64("gold"), Some(100));
        assert_eq!(entity.get_str("name"), Some("Ayla"));
        assert_eq!(entity.to_document(), doc);
    }

    #[test]
    fn documents_without_discriminator_are_rejected() {
        assert!(Entity::from_document(json!({"gold": 1})).is_err());
        assert!(Entity::from_document(json!({"_type": "", "gold": 1})).is_err());
    }

    #[test]
    fn discriminator_cannot_be_overwritten_through_set() {
        let mut entity = Entity::new(kind("mob"));
        assert_eq!(entity.set(KIND_FIELD, "player"), None);
        assert_eq!(entity.kind().as_ref(), "mob");
        assert!(entity.get(KIND_FIELD).is_none());
    }

    #[test]
    fn references_accept_single_ids_and_lists() {
        let entity = Entity::new(kind("player"))
            .with("weapon", "item_7")
            .with("party", json!(["p2", "p3", "", 4]));

        let weapon: Vec<String> = entity.references("weapon").iter().map(ToString::to_string).collect();
        let party: Vec<String> = entity.references("party").iter().map(ToString::to_string).collect();

        assert_eq!(weapon, vec!["item_7"]);
        assert_eq!(party, vec!["p2", "p3"]);
        assert!(entity.references("missing").is_empty());
    }

    #[test]
    fn set_returns_previous_value() {
        let mut entity = Entity::new(kind("player")).with("gold", 5);
        assert_eq!(entity.set("gold", 7), Some(json!(5)));
        assert_eq!(entity.remove("gold"), Some(json!(7)));
        assert_eq!(entity.get_i64("gold"), None);
    }
}

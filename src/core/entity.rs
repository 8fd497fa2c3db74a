use super::{FlowError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record snapshot: identifier, type name, and a JSON object of fields.
///
/// Snapshots are plain values; the "old" and "new" images of a lifecycle
/// event are two independent clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    pub fields: serde_json::Value,
}

impl Entity {
    /// Creates an entity with a generated identifier.
    pub fn new(entity_type: impl Into<String>, fields: serde_json::Value) -> Self {
        Self::with_id(EntityId::generate(), entity_type, fields)
    }

    pub fn with_id(
        id: EntityId,
        entity_type: impl Into<String>,
        fields: serde_json::Value,
    ) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            fields,
        }
    }

    /// Returns the fields as a JSON object, or an error if they are not an object.
    pub fn fields_object(&self) -> Result<&serde_json::Map<String, serde_json::Value>> {
        self.fields.as_object().ok_or_else(|| {
            FlowError::Execution("Entity fields must be a JSON object".to_string())
        })
    }

    pub fn fields_object_mut(
        &mut self,
    ) -> Result<&mut serde_json::Map<String, serde_json::Value>> {
        self.fields.as_object_mut().ok_or_else(|| {
            FlowError::Execution("Entity fields must be a JSON object".to_string())
        })
    }

    /// Returns a field value, or `None` when the field is absent.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.as_object().and_then(|fields| fields.get(name))
    }

    /// Returns a field as a string slice; absent, null, and non-string
    /// fields all yield `None`.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(|v| v.as_str())
    }

    /// True when the field is absent or explicitly null.
    pub fn is_null_field(&self, name: &str) -> bool {
        self.field(name).map_or(true, |v| v.is_null())
    }

    pub fn set_field(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let fields = self.fields_object_mut()?;
        fields.insert(name.into(), value);
        Ok(())
    }
}

/// Minimal write shape: identifier plus only the fields that changed.
///
/// Every persisted mutation the core submits goes through a patch, never a
/// full-record overwrite, so concurrent changes to unrelated fields are not
/// clobbered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePatch {
    pub id: EntityId,
    pub entity_type: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ChangePatch {
    pub fn new(id: EntityId, entity_type: impl Into<String>) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Records a changed field.
    pub fn set(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Folds another patch for the same entity into this one; later values
    /// win per field.
    pub fn merge(&mut self, other: ChangePatch) {
        for (name, value) in other.fields {
            self.fields.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_and_missing_fields_read_as_null() {
        let entity = Entity::new("Deal", json!({"stage": null, "amount": 100}));
        assert!(entity.is_null_field("stage"));
        assert!(entity.is_null_field("owner"));
        assert!(!entity.is_null_field("amount"));
    }

    #[test]
    fn patch_merge_keeps_later_values() {
        let id = EntityId::new("d1");
        let mut patch = ChangePatch::new(id.clone(), "Deal").set("stage", json!("New"));
        patch.merge(ChangePatch::new(id, "Deal").set("stage", json!("Won")));
        assert_eq!(patch.fields.get("stage"), Some(&json!("Won")));
    }

    #[test]
    fn non_object_fields_are_an_execution_error() {
        let entity = Entity::new("Deal", json!([1, 2, 3]));
        assert!(entity.fields_object().is_err());
    }
}

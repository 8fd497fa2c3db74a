pub mod memory;

pub use memory::MemoryStore;

use crate::core::{ChangePatch, Entity, EntityId, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Comparison operator for a [`FieldCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOp {
    Eq,
    Ne,
    NotNull,
}

/// A single field predicate applied server-side by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub op: FieldOp,
    pub value: serde_json::Value,
}

impl FieldCondition {
    pub fn eq(field: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            op: FieldOp::Eq,
            value,
        }
    }

    pub fn ne(field: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            op: FieldOp::Ne,
            value,
        }
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FieldOp::NotNull,
            value: serde_json::Value::Null,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        let actual = entity
            .field(&self.field)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        match self.op {
            FieldOp::Eq => actual == self.value,
            FieldOp::Ne => actual != self.value,
            FieldOp::NotNull => !actual.is_null(),
        }
    }
}

/// Bulk-read shape: rows whose `key_field` is in `keys`, further narrowed
/// by `conditions`. The key set is always explicit; the core never issues
/// unbounded scans.
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub key_field: String,
    pub keys: BTreeSet<String>,
    pub conditions: Vec<FieldCondition>,
}

impl QueryFilter {
    pub fn new(key_field: impl Into<String>, keys: BTreeSet<String>) -> Self {
        Self {
            key_field: key_field.into(),
            keys,
            conditions: Vec::new(),
        }
    }

    pub fn with_conditions(mut self, conditions: Vec<FieldCondition>) -> Self {
        self.conditions = conditions;
        self
    }
}

/// Deterministic ordering for query results; ties in lookup resolution are
/// broken by whichever row sorts first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub ascending: bool,
}

impl SortKey {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }

    pub fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        let left = a.field(&self.field).cloned().unwrap_or(serde_json::Value::Null);
        let right = b.field(&self.field).cloned().unwrap_or(serde_json::Value::Null);
        let ordering = value_cmp(&left, &right);
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

/// Total order over JSON scalars: null sorts first, then like types compare
/// natively, then everything else by textual form.
pub(crate) fn value_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (String(x), String(y)) => x.cmp(y),
        (Number(x), Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Bool(x), Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Outcome of persisting one patch within a bulk submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Failed(String),
}

/// Per-entity write result. Bulk writes are never assumed atomic; the
/// caller decides what a partial failure means for its transaction scope.
#[derive(Debug, Clone)]
pub struct SaveResult {
    pub id: EntityId,
    pub outcome: SaveOutcome,
}

impl SaveResult {
    pub fn saved(id: EntityId) -> Self {
        Self {
            id,
            outcome: SaveOutcome::Saved,
        }
    }

    pub fn failed(id: EntityId, reason: impl Into<String>) -> Self {
        Self {
            id,
            outcome: SaveOutcome::Failed(reason.into()),
        }
    }

    pub fn is_saved(&self) -> bool {
        self.outcome == SaveOutcome::Saved
    }
}

/// Persistence collaborator. The core only ever issues bulk reads keyed by
/// a foreign-key set and bulk writes of changed-field patches.
pub trait EntityStore {
    /// Reads entities of `entity_type` matching the filter, ordered by
    /// `order`. One call per lookup; the core never caches across calls.
    fn query(
        &self,
        entity_type: &str,
        filter: &QueryFilter,
        order: &SortKey,
    ) -> Result<Vec<Entity>>;

    /// Applies patches. With `allow_partial_failure` a failed patch is
    /// reported in its [`SaveResult`] and siblings still apply; without it
    /// the first failure aborts the submission with a `Save` error.
    fn save(
        &self,
        patches: &[ChangePatch],
        allow_partial_failure: bool,
    ) -> Result<Vec<SaveResult>>;
}

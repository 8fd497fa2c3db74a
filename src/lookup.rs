//! Batched foreign-key lookup resolution.
//!
//! Rules that need "the related record satisfying P" for each entity in a
//! batch collect the distinct foreign keys first and issue one read, never
//! a query per entity. The resulting map lives for the rule call only.

use crate::core::{Entity, Result};
use crate::store::{EntityStore, FieldCondition, QueryFilter, SortKey};
use std::collections::{BTreeSet, HashMap};

/// Describes one lookup: which related type to read, which field on the
/// batch carries the key, which field on the related type matches it, and
/// how ties between candidates for the same parent are broken.
#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub related_type: String,
    pub batch_key_field: String,
    pub related_key_field: String,
    pub conditions: Vec<FieldCondition>,
    pub order_by: SortKey,
}

impl LookupSpec {
    pub fn new(
        related_type: impl Into<String>,
        batch_key_field: impl Into<String>,
        related_key_field: impl Into<String>,
        order_by: SortKey,
    ) -> Self {
        Self {
            related_type: related_type.into(),
            batch_key_field: batch_key_field.into(),
            related_key_field: related_key_field.into(),
            conditions: Vec::new(),
            order_by,
        }
    }

    pub fn with_conditions(mut self, conditions: Vec<FieldCondition>) -> Self {
        self.conditions = conditions;
        self
    }
}

/// Resolves at most one related entity per distinct foreign key present in
/// `batch`.
///
/// Empty batches and batches with only null keys return an empty map
/// without touching the store. When several related entities share a
/// parent key, the one sorting first under `spec.order_by` wins and later
/// candidates are discarded.
pub fn build_lookup_map(
    store: &dyn EntityStore,
    batch: &[Entity],
    spec: &LookupSpec,
) -> Result<HashMap<String, Entity>> {
    let keys: BTreeSet<String> = batch
        .iter()
        .filter_map(|entity| entity.str_field(&spec.batch_key_field))
        .map(str::to_string)
        .collect();
    if keys.is_empty() {
        return Ok(HashMap::new());
    }

    let filter = QueryFilter::new(spec.related_key_field.clone(), keys)
        .with_conditions(spec.conditions.clone());
    let related = store.query(&spec.related_type, &filter, &spec.order_by)?;

    let mut map = HashMap::new();
    for entity in related {
        let Some(key) = entity.str_field(&spec.related_key_field).map(str::to_string) else {
            continue;
        };
        map.entry(key).or_insert(entity);
    }
    Ok(map)
}

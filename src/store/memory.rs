use super::{EntityStore, QueryFilter, SaveResult, SortKey};
use crate::core::{ChangePatch, Entity, EntityId, FlowError, Result};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

/// In-memory entity store used by the reference pipeline and tests.
///
/// Deleted entities move to a recycle bin so undelete can restore them with
/// their identifiers intact. Single-threaded by design, matching the
/// synchronous execution model of the dispatcher.
#[derive(Default)]
pub struct MemoryStore {
    tables: RefCell<HashMap<String, Vec<Entity>>>,
    recycle_bin: RefCell<HashMap<String, Vec<Entity>>>,
    queries_issued: Cell<usize>,
    failing_saves: RefCell<HashSet<EntityId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read queries issued so far. Lets tests assert that empty
    /// batches never reach the store.
    pub fn queries_issued(&self) -> usize {
        self.queries_issued.get()
    }

    /// Marks an entity so that any patch targeting it reports a failed
    /// save. Test hook for exercising partial-failure handling.
    pub fn fail_saves_for(&self, id: EntityId) {
        self.failing_saves.borrow_mut().insert(id);
    }

    /// Seeds entities directly, bypassing any trigger handling.
    pub fn insert_all(&self, entities: Vec<Entity>) {
        let mut tables = self.tables.borrow_mut();
        for entity in entities {
            tables
                .entry(entity.entity_type.clone())
                .or_default()
                .push(entity);
        }
    }

    /// Replaces the stored image of each entity; unknown ids are ignored.
    pub fn replace_all(&self, entities: Vec<Entity>) {
        let mut tables = self.tables.borrow_mut();
        for entity in entities {
            if let Some(rows) = tables.get_mut(&entity.entity_type) {
                if let Some(row) = rows.iter_mut().find(|row| row.id == entity.id) {
                    *row = entity;
                }
            }
        }
    }

    /// Moves the named entities to the recycle bin and returns the removed
    /// images, in the order the ids were given.
    pub fn remove_all(&self, entity_type: &str, ids: &[EntityId]) -> Vec<Entity> {
        let mut tables = self.tables.borrow_mut();
        let mut removed = Vec::new();
        if let Some(rows) = tables.get_mut(entity_type) {
            for id in ids {
                if let Some(pos) = rows.iter().position(|row| &row.id == id) {
                    removed.push(rows.remove(pos));
                }
            }
        }
        self.recycle_bin
            .borrow_mut()
            .entry(entity_type.to_string())
            .or_default()
            .extend(removed.iter().cloned());
        removed
    }

    /// Restores entities from the recycle bin and returns the restored
    /// images.
    pub fn restore_all(&self, entity_type: &str, ids: &[EntityId]) -> Vec<Entity> {
        let mut restored = Vec::new();
        {
            let mut bin = self.recycle_bin.borrow_mut();
            if let Some(rows) = bin.get_mut(entity_type) {
                for id in ids {
                    if let Some(pos) = rows.iter().position(|row| &row.id == id) {
                        restored.push(rows.remove(pos));
                    }
                }
            }
        }
        self.insert_all(restored.clone());
        restored
    }

    pub fn get(&self, entity_type: &str, id: &EntityId) -> Option<Entity> {
        self.tables
            .borrow()
            .get(entity_type)
            .and_then(|rows| rows.iter().find(|row| &row.id == id).cloned())
    }

    pub fn all(&self, entity_type: &str) -> Vec<Entity> {
        self.tables
            .borrow()
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }
}

impl EntityStore for MemoryStore {
    fn query(
        &self,
        entity_type: &str,
        filter: &QueryFilter,
        order: &SortKey,
    ) -> Result<Vec<Entity>> {
        self.queries_issued.set(self.queries_issued.get() + 1);
        let tables = self.tables.borrow();
        let mut matches: Vec<Entity> = tables
            .get(entity_type)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        row.str_field(&filter.key_field)
                            .map_or(false, |key| filter.keys.contains(key))
                    })
                    .filter(|row| filter.conditions.iter().all(|cond| cond.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matches.sort_by(|a, b| order.compare(a, b));
        Ok(matches)
    }

    fn save(
        &self,
        patches: &[ChangePatch],
        allow_partial_failure: bool,
    ) -> Result<Vec<SaveResult>> {
        let mut results = Vec::with_capacity(patches.len());
        for patch in patches {
            let failure = if self.failing_saves.borrow().contains(&patch.id) {
                Some("save rejected by store".to_string())
            } else if !self.apply_patch(patch)? {
                Some(format!(
                    "no {} entity with id {}",
                    patch.entity_type, patch.id
                ))
            } else {
                None
            };

            match failure {
                None => results.push(SaveResult::saved(patch.id.clone())),
                Some(reason) if allow_partial_failure => {
                    results.push(SaveResult::failed(patch.id.clone(), reason));
                }
                Some(reason) => {
                    return Err(FlowError::Save(format!("{}: {}", patch.id, reason)));
                }
            }
        }
        Ok(results)
    }
}

impl MemoryStore {
    /// Merges a patch into the stored image; returns false when the target
    /// entity does not exist.
    fn apply_patch(&self, patch: &ChangePatch) -> Result<bool> {
        let mut tables = self.tables.borrow_mut();
        let Some(rows) = tables.get_mut(&patch.entity_type) else {
            return Ok(false);
        };
        let Some(row) = rows.iter_mut().find(|row| row.id == patch.id) else {
            return Ok(false);
        };
        for (name, value) in &patch.fields {
            row.set_field(name.clone(), value.clone())?;
        }
        Ok(true)
    }
}

//! Reference host: drives dispatchers through whole operations against a
//! [`MemoryStore`], making the partial-failure contract concrete. Before
//! hooks run ahead of persistence and may veto individual entities; the
//! survivors persist and the matching after hook sees the persisted image.

use crate::core::{Entity, EntityId, FlowError, Result};
use crate::dispatch::{ExecutionContext, TriggerDispatcher, TriggerOutcome, TriggerPhase};
use crate::store::MemoryStore;
use std::collections::{BTreeMap, HashMap};

/// What one operation did: which entities persisted, which were rejected
/// by before-phase validation (and why), and the outcome of the after
/// hook, when one ran.
#[derive(Debug)]
pub struct OperationReport {
    pub persisted: Vec<EntityId>,
    pub rejected: BTreeMap<EntityId, String>,
    pub after: Option<TriggerOutcome>,
}

impl OperationReport {
    fn empty() -> Self {
        Self {
            persisted: Vec::new(),
            rejected: BTreeMap::new(),
            after: None,
        }
    }
}

/// Event source plus persistence glue for one store and any number of
/// entity types. One pipeline owns one [`ExecutionContext`], so a root
/// operation and everything it synchronously triggers share re-entrancy
/// flags.
pub struct RecordPipeline<'a> {
    store: &'a MemoryStore,
    context: ExecutionContext,
    dispatchers: HashMap<String, TriggerDispatcher>,
}

impl<'a> RecordPipeline<'a> {
    pub fn new(store: &'a MemoryStore) -> Self {
        Self {
            store,
            context: ExecutionContext::new(),
            dispatchers: HashMap::new(),
        }
    }

    /// Registers the dispatcher for its entity type, replacing any
    /// previous one.
    pub fn register(mut self, dispatcher: TriggerDispatcher) -> Self {
        self.dispatchers
            .insert(dispatcher.entity_type().to_string(), dispatcher);
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Inserts a batch: before-insert hook, persist survivors, then
    /// after-insert over the persisted image.
    pub fn insert(&self, entities: Vec<Entity>) -> Result<OperationReport> {
        let Some(entity_type) = batch_entity_type(&entities)? else {
            return Ok(OperationReport::empty());
        };
        let Some(dispatcher) = self.dispatchers.get(&entity_type) else {
            let persisted = ids_of(&entities);
            self.store.insert_all(entities);
            return Ok(OperationReport {
                persisted,
                rejected: BTreeMap::new(),
                after: None,
            });
        };

        let before = dispatcher.run(
            &self.context,
            self.store,
            TriggerPhase::BeforeInsert,
            None,
            Some(entities),
        )?;
        let (survivors, rejected) = split_rejected(before);
        let persisted = ids_of(&survivors);
        self.store.insert_all(survivors.clone());

        let after = dispatcher.run(
            &self.context,
            self.store,
            TriggerPhase::AfterInsert,
            None,
            Some(survivors),
        )?;
        Ok(OperationReport {
            persisted,
            rejected,
            after: Some(after),
        })
    }

    /// Updates a batch: the old image is the current store state for each
    /// id. Entities vetoed in before-update keep their old image; the
    /// rest persist the (possibly hook-mutated) new image.
    pub fn update(&self, entities: Vec<Entity>) -> Result<OperationReport> {
        let Some(entity_type) = batch_entity_type(&entities)? else {
            return Ok(OperationReport::empty());
        };
        let mut old = Vec::with_capacity(entities.len());
        for entity in &entities {
            let current = self.store.get(&entity_type, &entity.id).ok_or_else(|| {
                FlowError::Configuration(format!(
                    "cannot update unknown {entity_type} entity {}",
                    entity.id
                ))
            })?;
            old.push(current);
        }

        let Some(dispatcher) = self.dispatchers.get(&entity_type) else {
            let persisted = ids_of(&entities);
            self.store.replace_all(entities);
            return Ok(OperationReport {
                persisted,
                rejected: BTreeMap::new(),
                after: None,
            });
        };

        let before = dispatcher.run(
            &self.context,
            self.store,
            TriggerPhase::BeforeUpdate,
            Some(old.clone()),
            Some(entities),
        )?;
        let (survivors, rejected) = split_rejected(before);
        let persisted = ids_of(&survivors);
        self.store.replace_all(survivors.clone());

        let old_survivors: Vec<Entity> = old
            .into_iter()
            .filter(|entity| !rejected.contains_key(&entity.id))
            .collect();
        let after = dispatcher.run(
            &self.context,
            self.store,
            TriggerPhase::AfterUpdate,
            Some(old_survivors),
            Some(survivors),
        )?;
        Ok(OperationReport {
            persisted,
            rejected,
            after: Some(after),
        })
    }

    /// Deletes by id: before-delete over the current images, remove
    /// survivors to the recycle bin, after-delete over what was removed.
    pub fn delete(&self, entity_type: &str, ids: &[EntityId]) -> Result<OperationReport> {
        let old: Vec<Entity> = ids
            .iter()
            .filter_map(|id| self.store.get(entity_type, id))
            .collect();
        if old.is_empty() {
            return Ok(OperationReport::empty());
        }
        let Some(dispatcher) = self.dispatchers.get(entity_type) else {
            let removed = self.store.remove_all(entity_type, ids);
            return Ok(OperationReport {
                persisted: ids_of(&removed),
                rejected: BTreeMap::new(),
                after: None,
            });
        };

        let before = dispatcher.run(
            &self.context,
            self.store,
            TriggerPhase::BeforeDelete,
            Some(old),
            None,
        )?;
        let (survivors, rejected) = split_rejected_old(before);
        let removed = self.store.remove_all(entity_type, &ids_of(&survivors));

        let after = dispatcher.run(
            &self.context,
            self.store,
            TriggerPhase::AfterDelete,
            Some(removed.clone()),
            None,
        )?;
        Ok(OperationReport {
            persisted: ids_of(&removed),
            rejected,
            after: Some(after),
        })
    }

    /// Restores previously deleted entities; there is no before phase for
    /// undelete.
    pub fn undelete(&self, entity_type: &str, ids: &[EntityId]) -> Result<OperationReport> {
        let restored = self.store.restore_all(entity_type, ids);
        if restored.is_empty() {
            return Ok(OperationReport::empty());
        }
        let persisted = ids_of(&restored);
        let Some(dispatcher) = self.dispatchers.get(entity_type) else {
            return Ok(OperationReport {
                persisted,
                rejected: BTreeMap::new(),
                after: None,
            });
        };
        let after = dispatcher.run(
            &self.context,
            self.store,
            TriggerPhase::AfterUndelete,
            None,
            Some(restored),
        )?;
        Ok(OperationReport {
            persisted,
            rejected: BTreeMap::new(),
            after: Some(after),
        })
    }
}

fn ids_of(entities: &[Entity]) -> Vec<EntityId> {
    entities.iter().map(|entity| entity.id.clone()).collect()
}

/// All entities in one operation must share a type; mixed batches are a
/// host mistake, not a rule failure.
fn batch_entity_type(entities: &[Entity]) -> Result<Option<String>> {
    let Some(first) = entities.first() else {
        return Ok(None);
    };
    for entity in entities {
        if entity.entity_type != first.entity_type {
            return Err(FlowError::Configuration(format!(
                "mixed entity types in one batch: {} and {}",
                first.entity_type, entity.entity_type
            )));
        }
    }
    Ok(Some(first.entity_type.clone()))
}

/// Splits a before-phase outcome into entities that proceed to
/// persistence and the per-entity rejections.
fn split_rejected(outcome: TriggerOutcome) -> (Vec<Entity>, BTreeMap<EntityId, String>) {
    let TriggerOutcome { errors, batch, .. } = outcome;
    let survivors = batch
        .new
        .unwrap_or_default()
        .into_iter()
        .filter(|entity| !errors.contains_key(&entity.id))
        .collect();
    (survivors, errors)
}

/// Delete variant: the vetoed/surviving split applies to the old image.
fn split_rejected_old(outcome: TriggerOutcome) -> (Vec<Entity>, BTreeMap<EntityId, String>) {
    let TriggerOutcome { errors, batch, .. } = outcome;
    let survivors = batch
        .old
        .unwrap_or_default()
        .into_iter()
        .filter(|entity| !errors.contains_key(&entity.id))
        .collect();
    (survivors, errors)
}

use recordflow::{
    ChangePatch, Entity, EntityId, EntityStore, ExecutionContext, FlowError, MemoryStore,
    QueryFilter, SaveOutcome, SaveResult, SortKey, TriggerDispatcher, TriggerPhase, rules,
};
use recordflow::Result;
use serde_json::json;
use std::cell::Cell;
use std::sync::Arc;

fn deal(id: &str, stage: &str, history: &str) -> Entity {
    Entity::with_id(
        EntityId::new(id),
        "Deal",
        json!({ "stage": stage, "stage_history": history }),
    )
}

#[test]
fn missing_required_snapshot_is_a_configuration_error() {
    let store = MemoryStore::new();
    let context = ExecutionContext::new();
    let dispatcher = TriggerDispatcher::new("Deal");

    let err = dispatcher
        .run(&context, &store, TriggerPhase::BeforeUpdate, None, Some(vec![]))
        .unwrap_err();
    assert!(matches!(err, FlowError::Configuration(_)));

    let err = dispatcher
        .run(&context, &store, TriggerPhase::BeforeDelete, None, None)
        .unwrap_err();
    assert!(matches!(err, FlowError::Configuration(_)));
}

#[test]
fn unexpected_snapshot_is_a_configuration_error() {
    let store = MemoryStore::new();
    let context = ExecutionContext::new();
    let dispatcher = TriggerDispatcher::new("Deal");

    let err = dispatcher
        .run(
            &context,
            &store,
            TriggerPhase::BeforeInsert,
            Some(vec![deal("d1", "New", "")]),
            Some(vec![deal("d1", "New", "")]),
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::Configuration(_)));
}

#[test]
fn misaligned_update_snapshots_are_rejected() {
    let store = MemoryStore::new();
    let context = ExecutionContext::new();
    let dispatcher = TriggerDispatcher::new("Deal");

    let err = dispatcher
        .run(
            &context,
            &store,
            TriggerPhase::BeforeUpdate,
            Some(vec![deal("d1", "New", "")]),
            Some(vec![deal("d2", "New", "")]),
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::Configuration(_)));
}

#[test]
fn unregistered_phase_is_a_no_op() {
    let store = MemoryStore::new();
    let context = ExecutionContext::new();
    let dispatcher = TriggerDispatcher::new("Deal");

    let outcome = dispatcher
        .run(
            &context,
            &store,
            TriggerPhase::BeforeInsert,
            None,
            Some(vec![deal("d1", "New", "")]),
        )
        .unwrap();
    assert!(!outcome.skipped);
    assert!(outcome.errors.is_empty());
    assert!(outcome.saves.is_empty());
}

#[test]
fn stage_audit_with_identical_snapshots_queues_nothing_twice() {
    let store = MemoryStore::new();
    store.insert_all(vec![deal("d1", "New", "")]);
    let context = ExecutionContext::new();
    let dispatcher = TriggerDispatcher::new("Deal").guarded_hook(
        TriggerPhase::AfterUpdate,
        "stage_audit",
        rules::stage_audit("stage", "stage_history"),
    );

    for _ in 0..2 {
        let outcome = dispatcher
            .run(
                &context,
                &store,
                TriggerPhase::AfterUpdate,
                Some(vec![deal("d1", "New", "")]),
                Some(vec![deal("d1", "New", "")]),
            )
            .unwrap();
        assert!(!outcome.skipped);
        assert!(outcome.saves.is_empty());
    }
    assert_eq!(store.get("Deal", &EntityId::new("d1")).unwrap().str_field("stage_history"), Some(""));
}

#[test]
fn queued_saves_for_the_same_entity_merge_into_one_patch() {
    let store = MemoryStore::new();
    store.insert_all(vec![deal("d1", "New", "")]);
    let context = ExecutionContext::new();
    let dispatcher = TriggerDispatcher::new("Deal").hook(
        TriggerPhase::AfterUpdate,
        "double_patch",
        Arc::new(|invocation| {
            let id = invocation.new_entities()[0].id.clone();
            invocation.queue_save(ChangePatch::new(id.clone(), "Deal").set("stage", json!("Won")));
            invocation
                .queue_save(ChangePatch::new(id, "Deal").set("stage_history", json!("touched")));
            Ok(())
        }),
    );

    let outcome = dispatcher
        .run(
            &context,
            &store,
            TriggerPhase::AfterUpdate,
            Some(vec![deal("d1", "New", "")]),
            Some(vec![deal("d1", "New", "")]),
        )
        .unwrap();

    assert_eq!(outcome.saves.len(), 1);
    assert!(outcome.saves[0].is_saved());
    let stored = store.get("Deal", &EntityId::new("d1")).unwrap();
    assert_eq!(stored.str_field("stage"), Some("Won"));
    assert_eq!(stored.str_field("stage_history"), Some("touched"));
}

#[test]
fn failed_save_is_reported_per_entity_and_siblings_still_apply() {
    let store = MemoryStore::new();
    store.insert_all(vec![deal("d1", "New", ""), deal("d2", "New", "")]);
    store.fail_saves_for(EntityId::new("d2"));
    let context = ExecutionContext::new();
    let dispatcher = TriggerDispatcher::new("Deal").hook(
        TriggerPhase::AfterUpdate,
        "advance_all_stages",
        Arc::new(|invocation| {
            let patches: Vec<ChangePatch> = invocation
                .new_entities()
                .iter()
                .map(|entity| {
                    ChangePatch::new(entity.id.clone(), "Deal").set("stage", json!("Won"))
                })
                .collect();
            for patch in patches {
                invocation.queue_save(patch);
            }
            Ok(())
        }),
    );

    let snapshot = vec![deal("d1", "New", ""), deal("d2", "New", "")];
    let outcome = dispatcher
        .run(
            &context,
            &store,
            TriggerPhase::AfterUpdate,
            Some(snapshot.clone()),
            Some(snapshot),
        )
        .unwrap();

    assert_eq!(outcome.saves.len(), 2);
    assert_eq!(outcome.saves[0].id, EntityId::new("d1"));
    assert!(outcome.saves[0].is_saved());
    assert_eq!(outcome.saves[1].id, EntityId::new("d2"));
    assert!(matches!(outcome.saves[1].outcome, SaveOutcome::Failed(_)));

    // the sibling's patch applied; the failed entity kept its old image
    let stage = |id: &str| {
        store
            .get("Deal", &EntityId::new(id))
            .unwrap()
            .str_field("stage")
            .map(str::to_string)
    };
    assert_eq!(stage("d1").as_deref(), Some("Won"));
    assert_eq!(stage("d2").as_deref(), Some("New"));
}

#[test]
fn guard_is_released_after_a_hook_error() {
    let store = MemoryStore::new();
    let context = ExecutionContext::new();
    let dispatcher = TriggerDispatcher::new("Deal").guarded_hook(
        TriggerPhase::AfterUpdate,
        "failing_lookup",
        Arc::new(|_| Err(FlowError::Query("related read failed".to_string()))),
    );

    let old = vec![deal("d1", "New", "")];
    let new = vec![deal("d1", "Won", "")];
    let err = dispatcher
        .run(
            &context,
            &store,
            TriggerPhase::AfterUpdate,
            Some(old.clone()),
            Some(new.clone()),
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::Query(_)));
    assert!(!context.is_active("failing_lookup"));

    // a second dispatch runs the body again instead of being suppressed
    let err = dispatcher
        .run(&context, &store, TriggerPhase::AfterUpdate, Some(old), Some(new))
        .unwrap_err();
    assert!(matches!(err, FlowError::Query(_)));
}

/// Store that behaves like the hosting platform: every save of a Deal
/// synchronously re-dispatches the after-update trigger.
struct ReentrantStore<'a> {
    inner: &'a MemoryStore,
    dispatcher: &'a TriggerDispatcher,
    context: &'a ExecutionContext,
    old_image: Vec<Entity>,
    new_image: Vec<Entity>,
    nested_skips: Cell<usize>,
}

impl EntityStore for ReentrantStore<'_> {
    fn query(
        &self,
        entity_type: &str,
        filter: &QueryFilter,
        order: &SortKey,
    ) -> Result<Vec<Entity>> {
        self.inner.query(entity_type, filter, order)
    }

    fn save(
        &self,
        patches: &[ChangePatch],
        allow_partial_failure: bool,
    ) -> Result<Vec<SaveResult>> {
        let results = self.inner.save(patches, allow_partial_failure)?;
        let nested = self.dispatcher.run(
            self.context,
            self,
            TriggerPhase::AfterUpdate,
            Some(self.old_image.clone()),
            Some(self.new_image.clone()),
        )?;
        if nested.skipped {
            self.nested_skips.set(self.nested_skips.get() + 1);
        }
        Ok(results)
    }
}

#[test]
fn audit_hook_applies_exactly_once_despite_recursive_dispatch() {
    let memory = MemoryStore::new();
    memory.insert_all(vec![deal("d1", "New", "")]);
    let context = ExecutionContext::new();
    let dispatcher = TriggerDispatcher::new("Deal").guarded_hook(
        TriggerPhase::AfterUpdate,
        "stage_audit",
        rules::stage_audit("stage", "stage_history"),
    );

    let old = vec![deal("d1", "New", "")];
    let new = vec![deal("d1", "Won", "")];
    let store = ReentrantStore {
        inner: &memory,
        dispatcher: &dispatcher,
        context: &context,
        old_image: old.clone(),
        new_image: new.clone(),
        nested_skips: Cell::new(0),
    };

    let outcome = dispatcher
        .run(&context, &store, TriggerPhase::AfterUpdate, Some(old), Some(new))
        .unwrap();

    assert!(!outcome.skipped);
    assert_eq!(outcome.saves.len(), 1);
    assert!(outcome.saves[0].is_saved());
    // the save triggered a nested dispatch, and the guard suppressed it
    assert_eq!(store.nested_skips.get(), 1);

    let history = memory
        .get("Deal", &EntityId::new("d1"))
        .unwrap()
        .str_field("stage_history")
        .unwrap()
        .to_string();
    assert_eq!(history.lines().count(), 1);
    assert!(history.ends_with("New -> Won"), "unexpected audit line: {history}");
    assert!(!context.is_active("stage_audit"));
}

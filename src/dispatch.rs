//! Lifecycle dispatch: one optional hook per phase, with re-entrancy
//! guarding for hooks whose own saves would otherwise re-trigger them.

use crate::core::{ChangePatch, Entity, EntityId, FlowError, Result};
use crate::store::{EntityStore, SaveResult};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// One lifecycle moment. Exactly one phase is active per dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerPhase {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    AfterUndelete,
}

impl TriggerPhase {
    /// Whether the phase carries a pre-operation snapshot.
    pub fn requires_old(&self) -> bool {
        matches!(
            self,
            TriggerPhase::BeforeUpdate
                | TriggerPhase::AfterUpdate
                | TriggerPhase::BeforeDelete
                | TriggerPhase::AfterDelete
        )
    }

    /// Whether the phase carries a post-operation snapshot.
    pub fn requires_new(&self) -> bool {
        !matches!(self, TriggerPhase::BeforeDelete | TriggerPhase::AfterDelete)
    }

    /// Before phases run ahead of persistence and may veto individual
    /// entities; after phases see the persisted image.
    pub fn is_before(&self) -> bool {
        matches!(
            self,
            TriggerPhase::BeforeInsert | TriggerPhase::BeforeUpdate | TriggerPhase::BeforeDelete
        )
    }
}

impl std::fmt::Display for TriggerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TriggerPhase::BeforeInsert => "before_insert",
            TriggerPhase::AfterInsert => "after_insert",
            TriggerPhase::BeforeUpdate => "before_update",
            TriggerPhase::AfterUpdate => "after_update",
            TriggerPhase::BeforeDelete => "before_delete",
            TriggerPhase::AfterDelete => "after_delete",
            TriggerPhase::AfterUndelete => "after_undelete",
        };
        f.write_str(name)
    }
}

/// The old and new snapshots bound to one lifecycle event.
#[derive(Debug, Clone)]
pub struct TriggerBatch {
    pub old: Option<Vec<Entity>>,
    pub new: Option<Vec<Entity>>,
}

impl TriggerBatch {
    /// Binds snapshots to a phase, rejecting shapes the phase cannot
    /// carry: insert/undelete take only a new batch, delete only an old
    /// batch, update both with matching cardinality and pairwise ids.
    pub fn for_phase(
        phase: TriggerPhase,
        old: Option<Vec<Entity>>,
        new: Option<Vec<Entity>>,
    ) -> Result<Self> {
        match (phase.requires_old(), &old) {
            (true, None) => {
                return Err(FlowError::Configuration(format!(
                    "{phase} requires an old snapshot"
                )));
            }
            (false, Some(_)) => {
                return Err(FlowError::Configuration(format!(
                    "{phase} does not carry an old snapshot"
                )));
            }
            _ => {}
        }
        match (phase.requires_new(), &new) {
            (true, None) => {
                return Err(FlowError::Configuration(format!(
                    "{phase} requires a new snapshot"
                )));
            }
            (false, Some(_)) => {
                return Err(FlowError::Configuration(format!(
                    "{phase} does not carry a new snapshot"
                )));
            }
            _ => {}
        }
        if let (Some(old_rows), Some(new_rows)) = (&old, &new) {
            if old_rows.len() != new_rows.len() {
                return Err(FlowError::Configuration(format!(
                    "{phase} snapshots differ in cardinality: {} old vs {} new",
                    old_rows.len(),
                    new_rows.len()
                )));
            }
            for (old_row, new_row) in old_rows.iter().zip(new_rows) {
                if old_row.id != new_row.id {
                    return Err(FlowError::Configuration(format!(
                        "{phase} snapshots misaligned: {} paired with {}",
                        old_row.id, new_row.id
                    )));
                }
            }
        }
        Ok(Self { old, new })
    }

    pub fn old_entities(&self) -> &[Entity] {
        self.old.as_deref().unwrap_or_default()
    }

    pub fn new_entities(&self) -> &[Entity] {
        self.new.as_deref().unwrap_or_default()
    }
}

/// Re-entrancy state for one execution context: one root operation plus
/// everything it synchronously triggers. Not global; two contexts in the
/// same process never see each other's flags.
#[derive(Default)]
pub struct ExecutionContext {
    active: RefCell<HashSet<String>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, hook: &str) -> bool {
        self.active.borrow().contains(hook)
    }

    /// Marks a hook active, or returns `None` when it already is (the
    /// caller skips the hook body). The returned guard clears the flag on
    /// drop, so the flag cannot stay stuck after an error.
    pub fn enter(&self, hook: &str) -> Option<HookGuard<'_>> {
        if !self.active.borrow_mut().insert(hook.to_string()) {
            return None;
        }
        Some(HookGuard {
            context: self,
            hook: hook.to_string(),
        })
    }
}

/// Scoped re-entrancy flag; releases on every exit path.
pub struct HookGuard<'a> {
    context: &'a ExecutionContext,
    hook: String,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.context.active.borrow_mut().remove(&self.hook);
    }
}

/// Handler invoked for one phase with the bound batch.
pub type HookFn = Arc<dyn Fn(&mut TriggerInvocation<'_>) -> Result<()> + Send + Sync>;

struct RegisteredHook {
    name: String,
    guarded: bool,
    run: HookFn,
}

/// What a hook sees and may do during one dispatch: read the snapshots,
/// mutate the new image (before phases), attach per-entity validation
/// errors, and queue minimal saves for the dispatcher to flush.
pub struct TriggerInvocation<'a> {
    phase: TriggerPhase,
    batch: TriggerBatch,
    store: &'a dyn EntityStore,
    errors: BTreeMap<EntityId, String>,
    queued: Vec<ChangePatch>,
}

impl<'a> TriggerInvocation<'a> {
    fn new(phase: TriggerPhase, batch: TriggerBatch, store: &'a dyn EntityStore) -> Self {
        Self {
            phase,
            batch,
            store,
            errors: BTreeMap::new(),
            queued: Vec::new(),
        }
    }

    pub fn phase(&self) -> TriggerPhase {
        self.phase
    }

    pub fn store(&self) -> &'a dyn EntityStore {
        self.store
    }

    pub fn old_entities(&self) -> &[Entity] {
        self.batch.old_entities()
    }

    pub fn new_entities(&self) -> &[Entity] {
        self.batch.new_entities()
    }

    /// The entities the phase is about: the new image when present,
    /// otherwise the old one (delete phases).
    pub fn entities(&self) -> &[Entity] {
        if self.batch.new.is_some() {
            self.batch.new_entities()
        } else {
            self.batch.old_entities()
        }
    }

    /// Mutable access to the new image. Only meaningful in before phases,
    /// where the host persists the mutated image afterwards.
    pub fn new_entities_mut(&mut self) -> Result<&mut [Entity]> {
        self.batch
            .new
            .as_deref_mut()
            .ok_or_else(|| {
                FlowError::Execution(format!("{} carries no new snapshot to mutate", self.phase))
            })
    }

    /// Pairs each old entity with its new image; empty outside update
    /// phases.
    pub fn pairs(&self) -> impl Iterator<Item = (&Entity, &Entity)> {
        self.batch
            .old_entities()
            .iter()
            .zip(self.batch.new_entities())
    }

    /// Attaches a validation error to one entity. Persistence of that
    /// entity is aborted; siblings are unaffected.
    pub fn add_error(&mut self, id: EntityId, message: impl Into<String>) {
        self.errors.entry(id).or_insert_with(|| message.into());
    }

    /// Queues a minimal save to flush after the hook body. Patches for the
    /// same entity merge, later fields winning.
    pub fn queue_save(&mut self, patch: ChangePatch) {
        if let Some(existing) = self.queued.iter_mut().find(|p| p.id == patch.id) {
            existing.merge(patch);
        } else {
            self.queued.push(patch);
        }
    }
}

/// Result of one dispatch: whether the guard suppressed the hook, the
/// per-entity validation errors, the results of flushed saves, and the
/// (possibly mutated) batch handed back to the host.
#[derive(Debug)]
pub struct TriggerOutcome {
    pub skipped: bool,
    pub errors: BTreeMap<EntityId, String>,
    pub saves: Vec<SaveResult>,
    pub batch: TriggerBatch,
}

impl TriggerOutcome {
    fn pass_through(batch: TriggerBatch, skipped: bool) -> Self {
        Self {
            skipped,
            errors: BTreeMap::new(),
            saves: Vec::new(),
            batch,
        }
    }

    pub fn error_for(&self, id: &EntityId) -> Option<&str> {
        self.errors.get(id).map(String::as_str)
    }
}

/// Phase-to-hook table for one entity type. At most one hook per phase;
/// phases without a hook dispatch as no-ops.
pub struct TriggerDispatcher {
    entity_type: String,
    hooks: HashMap<TriggerPhase, RegisteredHook>,
}

impl TriggerDispatcher {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            hooks: HashMap::new(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Registers a hook for a phase, replacing any previous registration.
    pub fn hook(self, phase: TriggerPhase, name: impl Into<String>, run: HookFn) -> Self {
        self.register(phase, name, false, run)
    }

    /// Registers a hook that mutates the entity type it is triggered on.
    /// When its own save re-enters the same phase within one execution
    /// context, the nested dispatch is suppressed instead of re-applying
    /// the hook.
    pub fn guarded_hook(
        self,
        phase: TriggerPhase,
        name: impl Into<String>,
        run: HookFn,
    ) -> Self {
        self.register(phase, name, true, run)
    }

    fn register(
        mut self,
        phase: TriggerPhase,
        name: impl Into<String>,
        guarded: bool,
        run: HookFn,
    ) -> Self {
        self.hooks.insert(
            phase,
            RegisteredHook {
                name: name.into(),
                guarded,
                run,
            },
        );
        self
    }

    /// Dispatches one lifecycle event.
    ///
    /// Snapshot-shape violations fail with `Configuration` before any hook
    /// runs. A hook error propagates after the guard is released and no
    /// queued saves are flushed for that hook. Otherwise queued saves go
    /// to the store with partial failure allowed, and per-entity results
    /// land in the outcome.
    pub fn run(
        &self,
        context: &ExecutionContext,
        store: &dyn EntityStore,
        phase: TriggerPhase,
        old: Option<Vec<Entity>>,
        new: Option<Vec<Entity>>,
    ) -> Result<TriggerOutcome> {
        let batch = TriggerBatch::for_phase(phase, old, new)?;
        let Some(hook) = self.hooks.get(&phase) else {
            return Ok(TriggerOutcome::pass_through(batch, false));
        };

        let _guard = if hook.guarded {
            match context.enter(&hook.name) {
                Some(guard) => Some(guard),
                None => {
                    log::debug!(
                        "{}.{}: suppressed re-entrant {phase} dispatch",
                        self.entity_type,
                        hook.name
                    );
                    return Ok(TriggerOutcome::pass_through(batch, true));
                }
            }
        } else {
            None
        };

        log::debug!(
            "{}.{}: dispatching {phase} ({} old, {} new)",
            self.entity_type,
            hook.name,
            batch.old_entities().len(),
            batch.new_entities().len()
        );

        let mut invocation = TriggerInvocation::new(phase, batch, store);
        (hook.run)(&mut invocation)?;

        let TriggerInvocation {
            batch,
            errors,
            queued,
            ..
        } = invocation;
        let saves = if queued.is_empty() {
            Vec::new()
        } else {
            store.save(&queued, true)?
        };
        Ok(TriggerOutcome {
            skipped: false,
            errors,
            saves,
            batch,
        })
    }
}

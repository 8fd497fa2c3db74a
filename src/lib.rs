//! # recordflow
//!
//! Record-lifecycle trigger dispatch: when entities are inserted, updated,
//! deleted, or undeleted, a per-entity-type dispatcher fans out to one
//! optional hook per phase. Hooks default fields, validate (vetoing single
//! entities without touching siblings), resolve batched foreign-key
//! lookups, append stage-change audit lines, and fire best-effort
//! notifications. A re-entrancy guard scoped to one execution context
//! keeps a hook's own saves from re-applying the hook.
//!
//! Persistence and notification are collaborator traits
//! ([`store::EntityStore`], [`notify::Notifier`]); the crate ships an
//! in-memory store and a reference pipeline so rule sets are testable
//! end to end.
//!
//! ```
//! use recordflow::{Entity, MemoryStore, RecordPipeline, TriggerDispatcher, TriggerPhase, rules};
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! let pipeline = RecordPipeline::new(&store).register(
//!     TriggerDispatcher::new("Deal").hook(
//!         TriggerPhase::BeforeInsert,
//!         "default_stage",
//!         rules::default_field("stage", json!("New")),
//!     ),
//! );
//!
//! let report = pipeline
//!     .insert(vec![Entity::new("Deal", json!({ "stage": null, "amount": 1200 }))])
//!     .unwrap();
//! assert_eq!(report.persisted.len(), 1);
//! assert_eq!(store.all("Deal")[0].str_field("stage"), Some("New"));
//! ```

pub mod core;
pub mod dispatch;
pub mod lookup;
pub mod notify;
pub mod pipeline;
pub mod rules;
pub mod store;

pub use crate::core::{ChangePatch, Entity, EntityId, FlowError, Result};
pub use dispatch::{
    ExecutionContext, HookFn, HookGuard, TriggerBatch, TriggerDispatcher, TriggerInvocation,
    TriggerOutcome, TriggerPhase,
};
pub use lookup::{LookupSpec, build_lookup_map};
pub use notify::{NoopNotifier, Notifier};
pub use pipeline::{OperationReport, RecordPipeline};
pub use store::{
    EntityStore, FieldCondition, FieldOp, MemoryStore, QueryFilter, SaveOutcome, SaveResult,
    SortKey,
};

//! Rule constructors: the business predicates are parameters, the shapes
//! are fixed. Each constructor returns a [`HookFn`] ready to register on a
//! dispatcher phase.

use crate::core::ChangePatch;
use crate::dispatch::HookFn;
use crate::lookup::{LookupSpec, build_lookup_map};
use crate::notify::Notifier;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Renders a JSON scalar for audit text without quoting strings.
fn display_value(value: &serde_json::Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None if value.is_null() => "(none)".to_string(),
        None => value.to_string(),
    }
}

/// Runs several hooks in order within one invocation; the first error
/// stops the chain.
pub fn chain(hooks: Vec<HookFn>) -> HookFn {
    Arc::new(move |invocation| {
        for hook in &hooks {
            hook(invocation)?;
        }
        Ok(())
    })
}

/// Before-insert defaulting: entities with a null or missing `field` get
/// `default`; pre-set values are left untouched.
pub fn default_field(field: impl Into<String>, default: serde_json::Value) -> HookFn {
    let field = field.into();
    Arc::new(move |invocation| {
        for entity in invocation.new_entities_mut()? {
            if entity.is_null_field(&field) {
                entity.set_field(field.clone(), default.clone())?;
            }
        }
        Ok(())
    })
}

/// After-update stage audit: when `stage_field` changed and the new value
/// is non-null, append a timestamped line to the free-text `audit_field`
/// and queue a minimal save of just that field.
///
/// The queued save is itself an update of the same entity type, so this
/// hook must be registered with [`TriggerDispatcher::guarded_hook`];
/// otherwise its own flush would re-apply the audit line.
///
/// [`TriggerDispatcher::guarded_hook`]: crate::dispatch::TriggerDispatcher::guarded_hook
pub fn stage_audit(stage_field: impl Into<String>, audit_field: impl Into<String>) -> HookFn {
    let stage_field = stage_field.into();
    let audit_field = audit_field.into();
    Arc::new(move |invocation| {
        let mut patches = Vec::new();
        for (old, new) in invocation.pairs() {
            let before = old.field(&stage_field).cloned().unwrap_or(json!(null));
            let after = new.field(&stage_field).cloned().unwrap_or(json!(null));
            if before == after || after.is_null() {
                continue;
            }
            let line = format!(
                "{}: {} -> {}",
                Utc::now().to_rfc3339(),
                display_value(&before),
                display_value(&after)
            );
            let text = match new.str_field(&audit_field) {
                Some(existing) if !existing.is_empty() => format!("{existing}\n{line}"),
                _ => line,
            };
            patches.push(
                ChangePatch::new(new.id.clone(), new.entity_type.clone())
                    .set(audit_field.clone(), json!(text)),
            );
        }
        for patch in patches {
            invocation.queue_save(patch);
        }
        Ok(())
    })
}

/// Before-delete validation: resolves the lookup over the old batch and
/// attaches `message` as a validation error to every entity whose related
/// record carries `flag_field == flag_value`. Siblings without the flag
/// are untouched.
pub fn block_delete_when(
    spec: LookupSpec,
    flag_field: impl Into<String>,
    flag_value: serde_json::Value,
    message: impl Into<String>,
) -> HookFn {
    let flag_field = flag_field.into();
    let message = message.into();
    Arc::new(move |invocation| {
        let map = build_lookup_map(invocation.store(), invocation.old_entities(), &spec)?;
        let mut flagged = Vec::new();
        for entity in invocation.old_entities() {
            let Some(key) = entity.str_field(&spec.batch_key_field) else {
                continue;
            };
            let related_is_flagged = map
                .get(key)
                .and_then(|related| related.field(&flag_field))
                .map_or(false, |v| *v == flag_value);
            if related_is_flagged {
                flagged.push(entity.id.clone());
            }
        }
        for id in flagged {
            invocation.add_error(id, message.clone());
        }
        Ok(())
    })
}

/// Cross-object defaulting for before phases: resolves the lookup over the
/// new batch and copies `source_field` from the related record into
/// `target_field` on entities where the target is still unset.
pub fn copy_from_lookup(
    spec: LookupSpec,
    source_field: impl Into<String>,
    target_field: impl Into<String>,
) -> HookFn {
    let source_field = source_field.into();
    let target_field = target_field.into();
    Arc::new(move |invocation| {
        let map = build_lookup_map(invocation.store(), invocation.new_entities(), &spec)?;
        for entity in invocation.new_entities_mut()? {
            if !entity.is_null_field(&target_field) {
                continue;
            }
            let Some(key) = entity.str_field(&spec.batch_key_field) else {
                continue;
            };
            let Some(value) = map.get(key).and_then(|related| related.field(&source_field))
            else {
                continue;
            };
            let value = value.clone();
            entity.set_field(target_field.clone(), value)?;
        }
        Ok(())
    })
}

/// Best-effort notification for after phases: at most one send per
/// distinct value of `recipient_field` per invocation. Transport failures
/// are logged and swallowed, never propagated.
pub fn notify_on(
    recipient_field: impl Into<String>,
    subject: impl Into<String>,
    body: impl Into<String>,
    notifier: Arc<dyn Notifier>,
) -> HookFn {
    let recipient_field = recipient_field.into();
    let subject = subject.into();
    let body = body.into();
    Arc::new(move |invocation| {
        let mut notified = BTreeSet::new();
        for entity in invocation.entities() {
            let Some(recipient) = entity.str_field(&recipient_field) else {
                continue;
            };
            if !notified.insert(recipient.to_string()) {
                continue;
            }
            if let Err(err) = notifier.send(recipient, &subject, &body) {
                log::warn!("notification to {recipient} failed: {err}");
            }
        }
        Ok(())
    })
}

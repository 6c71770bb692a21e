//! Reconciler core — pure operation replay.
//!
//! Given the last known remote array for a field and the pending-operation
//! log, produce the field's next array by replaying, in log order, only the
//! ops that target that (match, field).

use serde_json::Value;

use crate::types::{record_id, ActionRecord, PendingOperation, CLEAR_FIELD_ID};

/// Replay `ops` over `current` for one (match, field) pair.
///
/// - `Add` removes any existing record with the same id, then appends
///   (idempotent re-apply, last-add-wins for a given id).
/// - `Delete` with [`CLEAR_FIELD_ID`] empties the field regardless of prior
///   state; with a concrete id it removes the match if present.
/// - `Edit` shallow-merges the patch onto the matching record. Edits to
///   records that were concurrently deleted remotely are silently dropped —
///   an accepted limitation of last-writer-wins per field.
pub fn apply_ops(
    current: &[ActionRecord],
    ops: &[PendingOperation],
    match_id: &str,
    field: &str,
) -> Vec<ActionRecord> {
    let mut actions = current.to_vec();

    for op in ops {
        if op.match_id() != match_id || op.field() != field {
            continue;
        }
        match op {
            PendingOperation::Add { record, .. } => {
                if let Some(id) = record_id(record) {
                    actions.retain(|r| record_id(r) != Some(id));
                }
                actions.push(record.clone());
            }
            PendingOperation::Delete { record_id: id, .. } => {
                if id == CLEAR_FIELD_ID {
                    actions.clear();
                } else {
                    actions.retain(|r| record_id(r) != Some(id.as_str()));
                }
            }
            PendingOperation::Edit {
                record_id: id,
                patch,
                ..
            } => {
                if let Some(target) = actions
                    .iter_mut()
                    .find(|r| record_id(r) == Some(id.as_str()))
                {
                    shallow_merge(target, patch);
                }
            }
        }
    }

    actions
}

/// Merge the top-level entries of `patch` onto `target`. Non-object inputs
/// are left untouched — records are objects by contract.
fn shallow_merge(target: &mut ActionRecord, patch: &Value) {
    if let (Some(target_map), Some(patch_map)) = (target.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_map {
            target_map.insert(key.clone(), value.clone());
        }
    }
}

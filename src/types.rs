//! Shared data types for the sync engine.
//!
//! A *match document* is the remote store's unit of fetch/write: a set of
//! named arrays of action records (passes, shots, regains, zone entries).
//! Records are JSON objects carrying a stable caller-assigned `"id"` string.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One action record — a JSON object with an `"id"` string field.
pub type ActionRecord = Value;

/// The named action arrays of one match document. `BTreeMap` keeps field
/// order deterministic across flushes.
pub type FieldMap = BTreeMap<String, Vec<ActionRecord>>;

/// Reserved record id meaning "remove all records in this field" rather than
/// one specific record.
pub const CLEAR_FIELD_ID: &str = "__all__";

/// Durable-storage key holding the JSON-serialized pending-operation log.
/// The key is removed (not written as `"[]"`) when the log becomes empty.
pub const PENDING_OPS_KEY: &str = "matchsync:pending-ops";

/// Durable-storage key for the manually-toggleable offline-mode flag.
pub const OFFLINE_MODE_KEY: &str = "matchsync:offline-mode";

// ============================================================================
// PendingOperation
// ============================================================================

/// A single unconfirmed local mutation, replayed in FIFO order; later
/// operations override earlier ones targeting the same record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PendingOperation {
    /// Append `record` to the field, replacing any record with the same id.
    #[serde(rename_all = "camelCase")]
    Add {
        match_id: String,
        field: String,
        record: ActionRecord,
    },
    /// Remove the record with `record_id`, or every record in the field when
    /// `record_id` is [`CLEAR_FIELD_ID`].
    #[serde(rename_all = "camelCase")]
    Delete {
        match_id: String,
        field: String,
        record_id: String,
    },
    /// Shallow-merge `patch` onto the record with `record_id`.
    #[serde(rename_all = "camelCase")]
    Edit {
        match_id: String,
        field: String,
        record_id: String,
        patch: Value,
    },
}

impl PendingOperation {
    pub fn match_id(&self) -> &str {
        match self {
            Self::Add { match_id, .. }
            | Self::Delete { match_id, .. }
            | Self::Edit { match_id, .. } => match_id,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::Add { field, .. } | Self::Delete { field, .. } | Self::Edit { field, .. } => {
                field
            }
        }
    }
}

// ============================================================================
// Dirty keys
// ============================================================================

/// Composite key for per-field bookkeeping: `"matchId:field"`.
pub fn dirty_key(match_id: &str, field: &str) -> String {
    format!("{match_id}:{field}")
}

/// Prefix matching every dirty key of one match.
pub fn match_key_prefix(match_id: &str) -> String {
    format!("{match_id}:")
}

/// Extract the record id of an action record, if present.
pub fn record_id(record: &ActionRecord) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

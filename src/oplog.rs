//! Persistent pending-operation log.
//!
//! An ordered (FIFO) sequence of [`PendingOperation`]s that have not yet been
//! confirmed written to the backing store. The whole log is serialized to one
//! well-known durable key on every enqueue and loaded lazily once per process
//! lifetime. Persistence failures are logged and swallowed: the operation
//! still takes effect in memory for the current session, at the cost of not
//! surviving a reload.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::KvStore;
use crate::types::{PendingOperation, PENDING_OPS_KEY};

/// Durable FIFO log of unflushed mutations.
///
/// Owns the [`PENDING_OPS_KEY`] storage key exclusively. The in-memory copy
/// is lazy: the first access loads from storage, later accesses reuse it.
pub struct PendingLog {
    kv: Arc<dyn KvStore>,
    ops: Mutex<Option<Vec<PendingOperation>>>,
}

impl PendingLog {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            ops: Mutex::new(None),
        }
    }

    /// Force the lazy load now (called once at engine construction so a
    /// reloaded session picks up where it left off).
    pub fn preload(&self) {
        self.with_ops(|_| ());
    }

    /// Append an operation and persist the whole log.
    pub fn push(&self, op: PendingOperation) {
        self.with_ops(|ops| ops.push(op));
    }

    /// All operations for one match, in insertion order.
    pub fn ops_for_match(&self, match_id: &str) -> Vec<PendingOperation> {
        self.with_ops(|ops| {
            ops.iter()
                .filter(|op| op.match_id() == match_id)
                .cloned()
                .collect()
        })
    }

    /// Distinct field names with pending operations for one match.
    pub fn fields_for_match(&self, match_id: &str) -> BTreeSet<String> {
        self.with_ops(|ops| {
            ops.iter()
                .filter(|op| op.match_id() == match_id)
                .map(|op| op.field().to_string())
                .collect()
        })
    }

    /// Distinct match ids with pending operations.
    pub fn match_ids(&self) -> BTreeSet<String> {
        self.with_ops(|ops| ops.iter().map(|op| op.match_id().to_string()).collect())
    }

    /// Drop every operation for one match and re-persist.
    pub fn remove_match(&self, match_id: &str) {
        self.with_ops(|ops| ops.retain(|op| op.match_id() != match_id));
    }

    pub fn len(&self) -> usize {
        self.with_ops(|ops| ops.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the loaded log, persisting afterwards if `f` mutated it.
    fn with_ops<T>(&self, f: impl FnOnce(&mut Vec<PendingOperation>) -> T) -> T {
        let mut guard = self.ops.lock();
        let ops = guard.get_or_insert_with(|| self.load());
        let before = ops.len();
        let snapshot_unchanged = {
            // Cheap change detection: length plus last element. Every mutation
            // the log performs (push, retain) changes at least one of these.
            let last = ops.last().cloned();
            (before, last)
        };
        let out = f(ops);
        if (ops.len(), ops.last().cloned()) != snapshot_unchanged {
            self.persist(ops);
        }
        out
    }

    fn load(&self) -> Vec<PendingOperation> {
        let raw = match self.kv.get(PENDING_OPS_KEY) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("failed to read pending-op log, starting empty: {e}");
                return Vec::new();
            }
        };
        match raw {
            None => Vec::new(),
            Some(json) => match serde_json::from_str(&json) {
                Ok(ops) => ops,
                Err(e) => {
                    log::warn!("corrupt pending-op log discarded: {e}");
                    Vec::new()
                }
            },
        }
    }

    fn persist(&self, ops: &[PendingOperation]) {
        let result = if ops.is_empty() {
            self.kv.remove(PENDING_OPS_KEY)
        } else {
            match serde_json::to_string(ops) {
                Ok(json) => self.kv.set(PENDING_OPS_KEY, &json),
                Err(e) => {
                    log::warn!("failed to serialize pending-op log: {e}");
                    return;
                }
            }
        };
        if let Err(e) = result {
            // The ops stay live in memory for this session; they just won't
            // survive a reload.
            log::warn!("failed to persist pending-op log: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

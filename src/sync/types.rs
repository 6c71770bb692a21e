//! Sync-specific types: the backing-store trait, engine options, and
//! flush-result structures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{StoreError, SyncError};
use crate::storage::KvStore;
use crate::types::{ActionRecord, FieldMap};

// ============================================================================
// MatchStore — the remote document store
// ============================================================================

/// Host-implemented backing store for match documents.
///
/// The engine never creates or deletes whole documents — it only updates
/// named array fields within an existing one, batched into a single partial
/// write per flush.
#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Fetch a match document. `Ok(None)` means the document does not exist;
    /// the engine then treats every field as empty.
    async fn fetch(&self, match_id: &str) -> Result<Option<FieldMap>, StoreError>;

    /// Apply a partial update: each named field is replaced wholesale with
    /// the given array, other fields are untouched.
    async fn partial_write(&self, match_id: &str, fields: &FieldMap) -> Result<(), StoreError>;
}

// ============================================================================
// State providers
// ============================================================================

/// Zero-argument callback returning the authoritative current in-memory array
/// for one field, registered by whichever live editor owns that field.
pub type StateProvider = dyn Fn() -> Vec<ActionRecord> + Send + Sync;

/// Callback invoked after a successful catch-up sync on reconnect.
pub type SyncedCallback = dyn Fn() + Send + Sync;

// ============================================================================
// Flush results
// ============================================================================

/// One match that failed to flush during a best-effort [`flush_all`].
///
/// [`flush_all`]: crate::sync::SyncEngine::flush_all
#[derive(Debug)]
pub struct FlushFailure {
    pub match_id: String,
    pub error: SyncError,
}

/// Outcome of a best-effort flush across matches. Failures never abort the
/// sweep; every match gets its attempt.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Matches flushed without error (including no-op flushes).
    pub flushed: Vec<String>,
    pub failures: Vec<FlushFailure>,
}

impl FlushReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

// ============================================================================
// EngineOptions
// ============================================================================

/// Configuration for [`SyncEngine`](crate::sync::SyncEngine).
pub struct EngineOptions {
    pub store: Arc<dyn MatchStore>,
    pub kv: Arc<dyn KvStore>,
    /// Debounce delay before a dirty field is flushed (default: 5 minutes).
    pub debounce: Option<Duration>,
    /// Mutation count that triggers an immediate flush, bypassing the
    /// debounce timer (default: 25).
    pub flush_threshold: Option<u32>,
    /// Called after a successful catch-up sync on reconnect.
    pub on_synced: Option<Arc<SyncedCallback>>,
}

impl EngineOptions {
    pub fn new(store: Arc<dyn MatchStore>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            kv,
            debounce: None,
            flush_threshold: None,
            on_synced: None,
        }
    }
}

//! SyncEngine — write-coalescing flush orchestration.
//!
//! All mutable state (pending log, dirty maps, timers, provider registry)
//! lives in one explicit engine instance so tests can run several engines
//! side by side. The engine is handed out as `Arc<SyncEngine>`; debounce
//! timers hold a `Weak` reference, so dropping the last `Arc` cancels them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::connectivity::Connectivity;
use crate::error::{Result, StorageError};
use crate::oplog::PendingLog;
use crate::types::{dirty_key, match_key_prefix, ActionRecord, FieldMap, PendingOperation};

use super::reconcile::apply_ops;
use super::types::{
    EngineOptions, FlushFailure, FlushReport, MatchStore, StateProvider, SyncedCallback,
};

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_FLUSH_THRESHOLD: u32 = 25;

// ============================================================================
// SyncEngine
// ============================================================================

pub struct SyncEngine {
    store: Arc<dyn MatchStore>,
    log: PendingLog,
    connectivity: Connectivity,
    /// match id → field → registered provider.
    providers: Mutex<HashMap<String, HashMap<String, ProviderEntry>>>,
    /// Dirty-key membership: "this field needs a flush even if the exact ops
    /// are unknown" (set whenever a provider-backed field mutates).
    dirty: Mutex<HashSet<String>>,
    /// Per-key mutation counter, reset on flush or threshold trigger.
    counts: Mutex<HashMap<String, u32>>,
    /// At most one outstanding debounce timer per dirty key. The generation
    /// token lets a fired timer remove only its own entry.
    timers: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    /// Per-match in-flight flush state.
    slots: Mutex<HashMap<String, Arc<Mutex<FlushSlot>>>>,
    next_token: AtomicU64,
    debounce: Duration,
    flush_threshold: u32,
    on_synced: Option<Arc<SyncedCallback>>,
}

struct ProviderEntry {
    token: u64,
    get: Arc<StateProvider>,
}

/// In-flight marker with a "run once more" coalescing flag: overlapping
/// flush requests for one match fold into the current cycle instead of
/// racing its fetch-then-write.
#[derive(Default)]
struct FlushSlot {
    running: bool,
    rerun: bool,
}

impl SyncEngine {
    /// Build an engine and preload the persisted pending-operation log, so a
    /// reloaded session picks up unflushed ops from the previous one.
    pub fn new(options: EngineOptions) -> Arc<Self> {
        let log = PendingLog::new(Arc::clone(&options.kv));
        log.preload();
        Arc::new(Self {
            store: options.store,
            log,
            connectivity: Connectivity::new(options.kv),
            providers: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            counts: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            debounce: options.debounce.unwrap_or(DEFAULT_DEBOUNCE),
            flush_threshold: options.flush_threshold.unwrap_or(DEFAULT_FLUSH_THRESHOLD).max(1),
            on_synced: options.on_synced,
        })
    }

    // -----------------------------------------------------------------------
    // Registration API
    // -----------------------------------------------------------------------

    /// Register the authoritative state provider for one (match, field).
    ///
    /// A later registration for the same pair overwrites the earlier one (the
    /// UI guarantees a single live editor per field). The returned handle's
    /// [`dispose`](ProviderHandle::dispose) removes only its own registration.
    pub fn register_state_provider(
        self: &Arc<Self>,
        match_id: &str,
        field: &str,
        get_state: impl Fn() -> Vec<ActionRecord> + Send + Sync + 'static,
    ) -> ProviderHandle {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = ProviderEntry {
            token,
            get: Arc::new(get_state),
        };
        self.providers
            .lock()
            .entry(match_id.to_string())
            .or_default()
            .insert(field.to_string(), entry);
        ProviderHandle {
            engine: Arc::downgrade(self),
            match_id: match_id.to_string(),
            field: field.to_string(),
            token,
        }
    }

    // -----------------------------------------------------------------------
    // Mutation entry points
    // -----------------------------------------------------------------------

    /// Record that a provider-backed field has unflushed local changes.
    ///
    /// Two independent triggers bound both write amplification and staleness:
    /// the mutation counter forces an immediate flush at the threshold, and
    /// the debounce timer flushes a field that merely sits dirty too long.
    pub fn mark_dirty(self: &Arc<Self>, match_id: &str, field: &str) {
        let key = dirty_key(match_id, field);
        self.dirty.lock().insert(key.clone());

        let count = {
            let mut counts = self.counts.lock();
            let c = counts.entry(key.clone()).or_insert(0);
            *c += 1;
            *c
        };

        if count >= self.flush_threshold {
            self.counts.lock().insert(key.clone(), 0);
            self.cancel_timer(&key);
            let weak = Arc::downgrade(self);
            let match_id = match_id.to_string();
            tokio::spawn(async move {
                let Some(engine) = weak.upgrade() else { return };
                if let Err(e) = engine.flush_match(&match_id).await {
                    log::warn!("threshold flush for {match_id} failed: {e}");
                }
            });
        } else {
            self.arm_timer(&key, match_id);
        }
    }

    /// Append an operation to the durable pending log.
    ///
    /// For mutations originating outside any mounted editor — no provider can
    /// hand back a snapshot, so the ops themselves must survive until replay.
    /// `mark_dirty` is the high-frequency path; this one persists every call.
    pub fn enqueue(&self, op: PendingOperation) {
        self.log.push(op);
    }

    // -----------------------------------------------------------------------
    // Flushing
    // -----------------------------------------------------------------------

    /// Flush every field of one match that has pending ops or dirty state,
    /// as a single partial write.
    ///
    /// On success the match's log entries, dirty flags, counters, and timers
    /// are cleared. On failure every piece of local state is left untouched
    /// so the next trigger retries the same logical write.
    ///
    /// A call that overlaps an in-flight flush of the same match does not
    /// race it: it flags the running cycle to run once more and returns.
    pub async fn flush_match(&self, match_id: &str) -> Result<()> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(match_id.to_string()).or_default())
        };

        {
            let mut state = slot.lock();
            if state.running {
                state.rerun = true;
                return Ok(());
            }
            state.running = true;
        }

        loop {
            let result = self.flush_match_inner(match_id).await;
            let rerun = {
                let mut state = slot.lock();
                if state.rerun {
                    state.rerun = false;
                    true
                } else {
                    state.running = false;
                    false
                }
            };
            if !rerun {
                return result;
            }
            // A mark_dirty/flush request landed mid-cycle; go around again so
            // its changes reach the store without an interleaved writer.
        }
    }

    async fn flush_match_inner(&self, match_id: &str) -> Result<()> {
        let log_ops = self.log.ops_for_match(match_id);
        let prefix = match_key_prefix(match_id);

        let mut fields: BTreeSet<String> =
            log_ops.iter().map(|op| op.field().to_string()).collect();
        {
            let dirty = self.dirty.lock();
            for key in dirty.iter().filter(|k| k.starts_with(&prefix)) {
                fields.insert(key[prefix.len()..].to_string());
            }
        }

        // Nothing pending anywhere — zero remote calls.
        if fields.is_empty() {
            return Ok(());
        }

        let mut updates = FieldMap::new();
        // The remote document is fetched lazily, at most once per flush, and
        // only when some field lacks a provider.
        let mut remote: Option<FieldMap> = None;

        for field in &fields {
            let provider = {
                let providers = self.providers.lock();
                providers
                    .get(match_id)
                    .and_then(|fields| fields.get(field))
                    .map(|entry| Arc::clone(&entry.get))
            };

            if let Some(get_state) = provider {
                // The editor's in-memory state already reflects every local
                // mutation — authoritative, no merge needed.
                updates.insert(field.clone(), get_state());
            } else {
                if remote.is_none() {
                    remote = Some(self.store.fetch(match_id).await?.unwrap_or_default());
                }
                let current = remote
                    .as_ref()
                    .and_then(|doc| doc.get(field))
                    .cloned()
                    .unwrap_or_default();
                updates.insert(field.clone(), apply_ops(&current, &log_ops, match_id, field));
            }
        }

        self.store.partial_write(match_id, &updates).await?;

        self.log.remove_match(match_id);
        self.dirty.lock().retain(|k| !k.starts_with(&prefix));
        self.counts.lock().retain(|k, _| !k.starts_with(&prefix));
        {
            let mut timers = self.timers.lock();
            timers.retain(|k, (_, handle)| {
                if k.starts_with(&prefix) {
                    handle.abort();
                    false
                } else {
                    true
                }
            });
        }
        Ok(())
    }

    /// Best-effort flush of every match with pending log entries, registered
    /// providers, or dirty fields. Individual failures are collected, never
    /// fatal to the sweep.
    pub async fn flush_all(&self) -> FlushReport {
        let mut ids: BTreeSet<String> = self.log.match_ids();
        ids.extend(self.providers.lock().keys().cloned());
        {
            let dirty = self.dirty.lock();
            for key in dirty.iter() {
                if let Some((match_id, _)) = key.split_once(':') {
                    ids.insert(match_id.to_string());
                }
            }
        }

        let mut report = FlushReport::default();
        for match_id in ids {
            match self.flush_match(&match_id).await {
                Ok(()) => report.flushed.push(match_id),
                Err(error) => report.failures.push(FlushFailure { match_id, error }),
            }
        }
        report
    }

    // -----------------------------------------------------------------------
    // Connectivity & lifecycle signals
    // -----------------------------------------------------------------------

    /// True only if the host reports the network up and offline mode is off.
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Toggle the durable offline-mode flag (used when the store is reachable
    /// but rejecting writes).
    pub fn set_offline_mode(&self, offline: bool) -> Result<(), StorageError> {
        self.connectivity.set_offline_mode(offline)
    }

    /// Host signal: network connectivity lost.
    pub fn network_lost(&self) {
        self.connectivity.set_network_up(false);
    }

    /// Host signal: the page is being hidden / the process is about to stop.
    ///
    /// Fire-and-forget: the host may go away before the flush completes; the
    /// durable log covers whatever the flush did not reach. Failures are
    /// logged, never raised across the signal boundary.
    pub fn suspend(self: &Arc<Self>) {
        if !self.is_online() {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let report = engine.flush_all().await;
            for failure in &report.failures {
                log::warn!("suspend flush for {} failed: {}", failure.match_id, failure.error);
            }
        });
    }

    /// Host signal: network connectivity restored.
    ///
    /// Runs a catch-up flush when truly online (offline mode still wins) and
    /// then invokes the `on_synced` callback so the host can refresh derived
    /// state. Callback panics are contained.
    pub fn resume(self: &Arc<Self>) {
        self.connectivity.set_network_up(true);
        if !self.is_online() {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let report = engine.flush_all().await;
            for failure in &report.failures {
                log::warn!("resume flush for {} failed: {}", failure.match_id, failure.error);
            }
            if report.is_ok() {
                if let Some(ref on_synced) = engine.on_synced {
                    let _ = catch_unwind(AssertUnwindSafe(|| on_synced()));
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Whether a match still has unflushed local changes — drives the host's
    /// "has unsynced changes" affordance.
    pub fn has_unsynced_changes(&self, match_id: &str) -> bool {
        if !self.log.ops_for_match(match_id).is_empty() {
            return true;
        }
        let prefix = match_key_prefix(match_id);
        self.dirty.lock().iter().any(|k| k.starts_with(&prefix))
    }

    /// Number of operations in the durable pending log.
    pub fn pending_ops_len(&self) -> usize {
        self.log.len()
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// (Re)arm the debounce timer for one dirty key, replacing any previous
    /// one. The task holds only a `Weak` engine reference: a dropped engine
    /// means a cancelled flush, not a leak.
    fn arm_timer(self: &Arc<Self>, key: &str, match_id: &str) {
        let generation = self.next_token.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let key_owned = key.to_string();
        let match_id = match_id.to_string();
        let debounce = self.debounce;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(engine) = weak.upgrade() else { return };
            {
                let mut timers = engine.timers.lock();
                // Only clear our own entry — a re-arm may have replaced it
                // between the sleep elapsing and this line running.
                if timers.get(&key_owned).map(|(g, _)| *g) == Some(generation) {
                    timers.remove(&key_owned);
                } else {
                    return;
                }
            }
            if let Err(e) = engine.flush_match(&match_id).await {
                log::warn!("debounce flush for {match_id} failed: {e}");
            }
        });

        let mut timers = self.timers.lock();
        if let Some((_, old)) = timers.insert(key.to_string(), (generation, handle)) {
            old.abort();
        }
    }

    fn cancel_timer(&self, key: &str) {
        if let Some((_, handle)) = self.timers.lock().remove(key) {
            handle.abort();
        }
    }

    fn unregister_provider(&self, match_id: &str, field: &str, token: u64) {
        let mut providers = self.providers.lock();
        if let Some(fields) = providers.get_mut(match_id) {
            if fields.get(field).map(|entry| entry.token) == Some(token) {
                fields.remove(field);
            }
            if fields.is_empty() {
                providers.remove(match_id);
            }
        }
    }
}

// ============================================================================
// ProviderHandle
// ============================================================================

/// Disposer returned by [`SyncEngine::register_state_provider`].
///
/// Disposal does not cancel pending flushes; it only means future flushes for
/// the field fall back to log-replay mode. Disposing after the registration
/// was overwritten is a no-op (token-matched), so an unmounting editor can
/// never tear down its successor's provider.
#[must_use = "dropping the handle without dispose() leaves the provider registered"]
pub struct ProviderHandle {
    engine: Weak<SyncEngine>,
    match_id: String,
    field: String,
    token: u64,
}

impl ProviderHandle {
    pub fn dispose(self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.unregister_provider(&self.match_id, &self.field, self.token);
        }
    }
}

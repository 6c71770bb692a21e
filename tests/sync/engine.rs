//! SyncEngine flush behavior: debounce, threshold, provider precedence,
//! crash survival, failure handling, and overlap coalescing.

use std::sync::Arc;
use std::time::Duration;

use matchsync::storage::{KvStore, MemoryKv};
use matchsync::sync::{EngineOptions, SyncEngine};
use matchsync::types::{FieldMap, PendingOperation, PENDING_OPS_KEY};
use serde_json::json;
use tokio::time::sleep;

use crate::MockStore;

fn engine_with(
    store: Arc<MockStore>,
    kv: Arc<MemoryKv>,
    debounce: Duration,
) -> Arc<SyncEngine> {
    let mut options = EngineOptions::new(store, kv);
    options.debounce = Some(debounce);
    SyncEngine::new(options)
}

fn add_op(match_id: &str, field: &str, record: serde_json::Value) -> PendingOperation {
    PendingOperation::Add {
        match_id: match_id.to_string(),
        field: field.to_string(),
        record,
    }
}

// ============================================================================
// End-to-end debounce flush
// ============================================================================

#[tokio::test(start_paused = true)]
async fn provider_field_flushes_after_debounce() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_millis(200));

    let _handle =
        engine.register_state_provider("m1", "shots", || vec![json!({"id": "s1", "minute": 10})]);
    engine.mark_dirty("m1", "shots");
    assert!(engine.has_unsynced_changes("m1"));

    // Not yet — still inside the debounce window.
    sleep(Duration::from_millis(50)).await;
    assert!(store.writes().is_empty());

    sleep(Duration::from_millis(200)).await;
    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    let (match_id, fields) = &writes[0];
    assert_eq!(match_id, "m1");
    let mut expected = FieldMap::new();
    expected.insert("shots".to_string(), vec![json!({"id": "s1", "minute": 10})]);
    assert_eq!(fields, &expected);

    // Dirty and log state are empty afterwards.
    assert!(!engine.has_unsynced_changes("m1"));
    assert_eq!(engine.pending_ops_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_mark_dirty_rearms_the_timer() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_millis(200));

    let _handle = engine.register_state_provider("m1", "shots", || vec![json!({"id": "s1"})]);

    // Three marks 100ms apart: each re-arms, so no flush before the last
    // window closes.
    for _ in 0..3 {
        engine.mark_dirty("m1", "shots");
        sleep(Duration::from_millis(100)).await;
        assert!(store.writes().is_empty());
    }

    sleep(Duration::from_millis(150)).await;
    assert_eq!(store.writes().len(), 1);
}

// ============================================================================
// Threshold flush
// ============================================================================

#[tokio::test(start_paused = true)]
async fn threshold_triggers_immediate_flush() {
    let store = Arc::new(MockStore::new());
    // Debounce far beyond the test horizon: only the counter can flush.
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    let _handle = engine.register_state_provider("m1", "shots", || vec![json!({"id": "s1"})]);
    for _ in 0..25 {
        engine.mark_dirty("m1", "shots");
    }

    // Let the spawned flush run; well under the debounce delay.
    sleep(Duration::from_millis(5)).await;
    assert_eq!(store.writes().len(), 1);
    assert!(!engine.has_unsynced_changes("m1"));
}

#[tokio::test(start_paused = true)]
async fn below_threshold_waits_for_the_timer() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    let _handle = engine.register_state_provider("m1", "shots", || vec![json!({"id": "s1"})]);
    for _ in 0..24 {
        engine.mark_dirty("m1", "shots");
    }

    sleep(Duration::from_millis(5)).await;
    assert!(store.writes().is_empty());
    assert!(engine.has_unsynced_changes("m1"));
}

// ============================================================================
// Provider precedence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn provider_value_wins_over_stale_log() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    // Stale enqueued ops for the same field…
    engine.enqueue(add_op("m1", "shots", json!({"id": "old"})));
    // …but a live provider holds the authoritative state.
    let _handle = engine.register_state_provider("m1", "shots", || vec![json!({"id": "fresh"})]);

    engine.flush_match("m1").await.unwrap();

    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1["shots"], vec![json!({"id": "fresh"})]);
    // No fetch needed: the provider bypassed the remote merge entirely.
    assert_eq!(store.fetch_count(), 0);
    // The match's log entries are gone after the successful flush.
    assert_eq!(engine.pending_ops_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn disposed_provider_falls_back_to_log_replay() {
    let store = Arc::new(MockStore::new());
    store.put_document("m1", FieldMap::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    let handle = engine.register_state_provider("m1", "shots", || vec![json!({"id": "provided"})]);
    handle.dispose();

    engine.enqueue(add_op("m1", "shots", json!({"id": "replayed"})));
    engine.flush_match("m1").await.unwrap();

    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1["shots"], vec![json!({"id": "replayed"})]);
    assert_eq!(store.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_handle_cannot_dispose_its_successor() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    let first = engine.register_state_provider("m1", "shots", || vec![json!({"id": "first"})]);
    let second = engine.register_state_provider("m1", "shots", || vec![json!({"id": "second"})]);
    // The first editor unmounts late — after its replacement registered.
    first.dispose();

    engine.mark_dirty("m1", "shots");
    engine.flush_match("m1").await.unwrap();

    assert_eq!(store.writes()[0].1["shots"], vec![json!({"id": "second"})]);
    second.dispose();
}

// ============================================================================
// Log replay against the remote snapshot
// ============================================================================

#[tokio::test(start_paused = true)]
async fn replay_merges_onto_remote_snapshot() {
    let store = Arc::new(MockStore::new());
    let mut doc = FieldMap::new();
    doc.insert(
        "shots".to_string(),
        vec![json!({"id": "s1", "minute": 5}), json!({"id": "s2", "minute": 30})],
    );
    store.put_document("m1", doc);

    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));
    engine.enqueue(PendingOperation::Edit {
        match_id: "m1".to_string(),
        field: "shots".to_string(),
        record_id: "s1".to_string(),
        patch: json!({"minute": 7}),
    });
    engine.enqueue(PendingOperation::Delete {
        match_id: "m1".to_string(),
        field: "shots".to_string(),
        record_id: "s2".to_string(),
    });

    engine.flush_match("m1").await.unwrap();

    let writes = store.writes();
    assert_eq!(writes[0].1["shots"], vec![json!({"id": "s1", "minute": 7})]);
}

#[tokio::test(start_paused = true)]
async fn missing_remote_document_replays_from_empty() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    engine.enqueue(add_op("m1", "regains", json!({"id": "r1", "zone": 4})));
    engine.flush_match("m1").await.unwrap();

    assert_eq!(
        store.writes()[0].1["regains"],
        vec![json!({"id": "r1", "zone": 4})]
    );
}

// ============================================================================
// Crash survival
// ============================================================================

#[tokio::test(start_paused = true)]
async fn flush_after_reload_matches_flush_without_reload() {
    let ops = [
        add_op("m1", "shots", json!({"id": "s1", "minute": 10})),
        add_op("m1", "shots", json!({"id": "s2", "minute": 55})),
        PendingOperation::Delete {
            match_id: "m1".to_string(),
            field: "shots".to_string(),
            record_id: "s1".to_string(),
        },
    ];

    // Path A: enqueue and flush in one session.
    let store_a = Arc::new(MockStore::new());
    let engine_a = engine_with(store_a.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));
    for op in &ops {
        engine_a.enqueue(op.clone());
    }
    engine_a.flush_match("m1").await.unwrap();

    // Path B: enqueue, drop the engine, reload from the same durable storage.
    let kv = Arc::new(MemoryKv::new());
    let store_b = Arc::new(MockStore::new());
    {
        let first_session = engine_with(store_b.clone(), kv.clone(), Duration::from_secs(3600));
        for op in &ops {
            first_session.enqueue(op.clone());
        }
    }
    let second_session = engine_with(store_b.clone(), kv.clone(), Duration::from_secs(3600));
    assert_eq!(second_session.pending_ops_len(), 3);
    second_session.flush_match("m1").await.unwrap();

    assert_eq!(store_a.writes()[0].1, store_b.writes()[0].1);
    // The durable key is removed once the log empties.
    assert_eq!(kv.get(PENDING_OPS_KEY).unwrap(), None);
}

// ============================================================================
// No-op flush
// ============================================================================

#[tokio::test(start_paused = true)]
async fn clean_match_flushes_without_remote_calls() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    engine.flush_match("m1").await.unwrap();

    assert_eq!(store.fetch_count(), 0);
    assert!(store.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn provider_without_dirty_state_is_not_flushed() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    let _handle = engine.register_state_provider("m1", "shots", || vec![json!({"id": "s1"})]);
    engine.flush_match("m1").await.unwrap();

    assert!(store.writes().is_empty());
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_write_keeps_all_local_state_for_retry() {
    let store = Arc::new(MockStore::new());
    let kv = Arc::new(MemoryKv::new());
    let engine = engine_with(store.clone(), kv.clone(), Duration::from_secs(3600));

    engine.enqueue(add_op("m1", "shots", json!({"id": "s1"})));
    store.set_fail_writes(true);

    assert!(engine.flush_match("m1").await.is_err());
    assert_eq!(engine.pending_ops_len(), 1);
    assert!(engine.has_unsynced_changes("m1"));
    assert!(kv.get(PENDING_OPS_KEY).unwrap().is_some());

    // The next natural trigger retries the same logical write.
    store.set_fail_writes(false);
    engine.flush_match("m1").await.unwrap();
    assert_eq!(store.writes().len(), 1);
    assert_eq!(engine.pending_ops_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn flush_all_continues_past_individual_failures() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    engine.enqueue(add_op("m1", "shots", json!({"id": "s1"})));
    engine.enqueue(add_op("m2", "passes", json!({"id": "p1"})));
    store.fail_match("m1");

    let report = engine.flush_all().await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].match_id, "m1");
    assert_eq!(report.flushed, vec!["m2".to_string()]);
    // m2 landed, m1's ops are still pending.
    assert_eq!(store.writes().len(), 1);
    assert_eq!(store.writes()[0].0, "m2");
    assert!(engine.has_unsynced_changes("m1"));
    assert!(!engine.has_unsynced_changes("m2"));
}

// ============================================================================
// Batching across fields
// ============================================================================

#[tokio::test(start_paused = true)]
async fn dirty_fields_of_one_match_share_a_single_write() {
    let store = Arc::new(MockStore::new());
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    let _shots = engine.register_state_provider("m1", "shots", || vec![json!({"id": "s1"})]);
    let _passes = engine.register_state_provider("m1", "passes", || vec![json!({"id": "p1"})]);
    engine.mark_dirty("m1", "shots");
    engine.mark_dirty("m1", "passes");

    engine.flush_match("m1").await.unwrap();

    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1.len(), 2);
    assert!(writes[0].1.contains_key("shots"));
    assert!(writes[0].1.contains_key("passes"));
}

// ============================================================================
// Overlap coalescing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn overlapping_flushes_coalesce_into_one_write() {
    let store = Arc::new(MockStore::new());
    store.set_write_delay(Duration::from_millis(50));
    let engine = engine_with(store.clone(), Arc::new(MemoryKv::new()), Duration::from_secs(3600));

    engine.enqueue(add_op("m1", "shots", json!({"id": "s1"})));

    let e1 = engine.clone();
    let e2 = engine.clone();
    let (r1, r2) = tokio::join!(
        async move { e1.flush_match("m1").await },
        async move { e2.flush_match("m1").await },
    );
    r1.unwrap();
    r2.unwrap();

    // The second call folded into the first cycle; its re-run found nothing
    // left to write.
    assert_eq!(store.writes().len(), 1);
    assert_eq!(engine.pending_ops_len(), 0);
}

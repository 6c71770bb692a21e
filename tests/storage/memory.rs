//! MemoryKv contract tests.

use matchsync::storage::{KvStore, MemoryKv};

#[test]
fn absent_key_is_none() {
    let kv = MemoryKv::new();
    assert_eq!(kv.get("missing").unwrap(), None);
}

#[test]
fn set_then_get_roundtrips() {
    let kv = MemoryKv::new();
    kv.set("k", "v1").unwrap();
    assert_eq!(kv.get("k").unwrap().as_deref(), Some("v1"));
}

#[test]
fn set_overwrites() {
    let kv = MemoryKv::new();
    kv.set("k", "v1").unwrap();
    kv.set("k", "v2").unwrap();
    assert_eq!(kv.get("k").unwrap().as_deref(), Some("v2"));
    assert_eq!(kv.len(), 1);
}

#[test]
fn remove_deletes_and_tolerates_absent_keys() {
    let kv = MemoryKv::new();
    kv.set("k", "v").unwrap();
    kv.remove("k").unwrap();
    assert_eq!(kv.get("k").unwrap(), None);
    // Removing again is a no-op.
    kv.remove("k").unwrap();
    assert!(kv.is_empty());
}

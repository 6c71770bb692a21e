//! Durable key-value storage trait.
//!
//! The engine keeps two well-known keys here: the serialized pending-operation
//! log and the offline-mode flag. No other component reads or writes those
//! keys directly.

use crate::error::{Result, StorageError};

/// Durable string key-value store.
///
/// Implementors must be `Send + Sync` so one store can be shared between the
/// engine and the host (e.g. for the offline-mode toggle).
pub trait KvStore: Send + Sync {
    /// Read a value. Absence of the key is `Ok(None)`, not an error.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write (insert or replace) a value.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key. Removing an absent key is a no-op.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

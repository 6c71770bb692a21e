//! In-memory `KvStore` — volatile storage for tests and ephemeral sessions.
//!
//! Share one `Arc<MemoryKv>` between two engine instances to simulate a page
//! reload: the second engine sees whatever the first persisted.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Result, StorageError};

use super::traits::KvStore;

/// HashMap-backed key-value store with interior mutability.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

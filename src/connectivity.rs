//! Connectivity predicate.
//!
//! "Online" requires two independent signals: the host reports network
//! connectivity, and the manually-settable offline-mode flag is not set. The
//! flag covers the case where the network is fine but the backing store is
//! returning permission/availability errors — the rest of the system behaves
//! identically under either failure mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, StorageError};
use crate::storage::KvStore;
use crate::types::OFFLINE_MODE_KEY;

pub struct Connectivity {
    network_up: AtomicBool,
    kv: Arc<dyn KvStore>,
}

impl Connectivity {
    /// Starts with the network assumed up; the host corrects this via
    /// [`set_network_up`](Self::set_network_up) as signals arrive.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            network_up: AtomicBool::new(true),
            kv,
        }
    }

    pub fn set_network_up(&self, up: bool) {
        self.network_up.store(up, Ordering::SeqCst);
    }

    pub fn network_up(&self) -> bool {
        self.network_up.load(Ordering::SeqCst)
    }

    /// Whether the manual offline-mode flag is set. A storage read failure
    /// counts as "not set" — staying online is the safer degradation, since
    /// flushes that then fail leave all local state intact anyway.
    pub fn offline_mode(&self) -> bool {
        match self.kv.get(OFFLINE_MODE_KEY) {
            Ok(flag) => flag.as_deref() == Some("1"),
            Err(e) => {
                log::warn!("failed to read offline-mode flag: {e}");
                false
            }
        }
    }

    /// Toggle the durable offline-mode flag.
    pub fn set_offline_mode(&self, offline: bool) -> Result<(), StorageError> {
        if offline {
            self.kv.set(OFFLINE_MODE_KEY, "1")
        } else {
            self.kv.remove(OFFLINE_MODE_KEY)
        }
    }

    /// True only if the network is up **and** offline mode is not set.
    pub fn is_online(&self) -> bool {
        self.network_up() && !self.offline_mode()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! matchsync — local-first write-coalescing sync engine for match-event data.
//!
//! Lets a user keep editing match actions while intermittently or permanently
//! offline: local mutations accumulate in a durable pending-operation log or
//! behind registered state providers, bursts of edits coalesce into one
//! partial write per match, and a failed write leaves every piece of local
//! state in place for the next trigger to retry.

pub mod connectivity;
pub mod error;
pub mod oplog;
pub mod storage;
pub mod sync;
pub mod types;

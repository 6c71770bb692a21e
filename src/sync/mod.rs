pub mod engine;
pub mod reconcile;
pub mod types;

pub use engine::{ProviderHandle, SyncEngine};
pub use reconcile::apply_ops;
pub use types::{
    EngineOptions, FlushFailure, FlushReport, MatchStore, StateProvider, SyncedCallback,
};

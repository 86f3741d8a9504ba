//! Offline-first synchronization layer.
//!
//! Local mutations are queued durably and replayed against the backend in
//! creation order; remote listings are merged back into the local cache.

pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod queue;


pub use conflict::{decide_merge, MergeDecision};
pub use connectivity::ConnectivityMonitor;
pub use engine::{
    BootstrapReport, EngineConfig, OperatingMode, PassOutcome, PassReport, SkipReason, SyncEngine,
    SyncHandle, SyncStats,
};
pub use queue::{FailOutcome, OperationQueue, RetryPolicy};

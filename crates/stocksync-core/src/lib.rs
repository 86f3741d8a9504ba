//! # stocksync Core Library
//!
//! Offline-first synchronization for a production, sales and inventory
//! backend. Application code reads and writes entities through
//! [`DataAccess`]; mutations are committed to an on-device SQLite store
//! together with a durable queue entry, and the [`SyncEngine`] replays the
//! queue against the backend and pulls remote changes back whenever the
//! backend is reachable.
//!
//! ## Architecture
//!
//! - **Connectivity**: [`ConnectivityMonitor`] probes the backend with a
//!   bounded timeout and reports offline/online edges
//! - **Storage**: [`LocalStore`] (SQLite, WAL) and TOML-based [`Config`]
//! - **Queue**: [`OperationQueue`], global FIFO with capped exponential
//!   backoff and dead operations
//! - **Engine**: bootstrap, periodic and forced reconciliation, merge policy
//! - **Remote**: the [`RemoteBackend`] capability, with an HTTP adapter and an
//!   in-memory backend for tests
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the binary.

pub mod error;
pub mod events;
pub mod facade;
pub mod model;
pub mod remote;
pub mod storage;
pub mod sync;

pub use error::{ConfigError, CoreError, DatabaseError, SyncError, ValidationError};
pub use events::SyncEvent;
pub use facade::{AccessStatus, DataAccess, WriteOutcome};
pub use model::{Entity, EntityType, OperationKind, OperationState, QueuedOperation};
pub use remote::{HttpBackend, MemoryBackend, RemoteBackend, RemoteError};
pub use storage::{Config, LocalStore};
pub use sync::{
    BootstrapReport, ConnectivityMonitor, EngineConfig, OperatingMode, OperationQueue, PassOutcome,
    PassReport, RetryPolicy, SkipReason, SyncEngine, SyncHandle, SyncStats,
};

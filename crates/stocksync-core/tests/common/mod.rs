//! Shared fixtures for the sync integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stocksync_core::{
    ConnectivityMonitor, DataAccess, EngineConfig, LocalStore, MemoryBackend, RemoteBackend,
    RetryPolicy, SyncEngine, SyncEvent,
};
use tokio::sync::broadcast;

pub struct Fixture {
    pub backend: Arc<MemoryBackend>,
    pub engine: Arc<SyncEngine>,
    pub access: DataAccess,
}

/// Retry immediately so tests can exhaust the budget without waiting.
pub fn fast_retry_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            base_delay: Duration::ZERO,
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    }
}

pub fn memory_store() -> LocalStore {
    LocalStore::open_memory().expect("in-memory store")
}

pub fn fixture_with(store: LocalStore, backend: Arc<MemoryBackend>, config: EngineConfig) -> Fixture {
    let remote: Arc<dyn RemoteBackend> = Arc::clone(&backend) as Arc<dyn RemoteBackend>;
    let monitor = Arc::new(ConnectivityMonitor::new(
        Arc::clone(&remote),
        Duration::from_secs(5),
    ));
    let engine = Arc::new(SyncEngine::new(Arc::new(store), remote, monitor, config));
    let access = DataAccess::new(Arc::clone(&engine));
    Fixture {
        backend,
        engine,
        access,
    }
}

/// Initialized fixture over an in-memory store.
pub async fn fixture(reachable: bool) -> Fixture {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_reachable(reachable);
    let fx = fixture_with(memory_store(), backend, fast_retry_config());
    fx.engine.initialize().await;
    fx
}

/// Drain whatever is currently buffered on an event receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

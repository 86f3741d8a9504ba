//! Engine wiring shared by every command that touches the store or backend.

use std::sync::Arc;
use std::time::Duration;

use stocksync_core::{
    Config, ConnectivityMonitor, DataAccess, EngineConfig, HttpBackend, LocalStore, RemoteBackend,
    SyncEngine,
};

pub struct Context {
    pub engine: Arc<SyncEngine>,
    pub access: DataAccess,
}

impl Context {
    /// Build the engine from the on-disk config. Nothing is probed yet.
    pub fn open() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Config::load()?;

        let remote: Arc<dyn RemoteBackend> = Arc::new(HttpBackend::new(
            &config.remote.base_url,
            Duration::from_secs(config.remote.request_timeout_secs),
            config.auth_token(),
        )?);
        let store = Arc::new(LocalStore::open_or_unavailable(config.database_path()?));
        let monitor = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&remote),
            config.sync.probe_timeout(),
        ));
        let engine = Arc::new(SyncEngine::new(
            store,
            remote,
            monitor,
            EngineConfig::from_config(&config),
        ));
        let access = DataAccess::new(Arc::clone(&engine));

        Ok(Self { engine, access })
    }

    /// Open and bootstrap without running a pass, for one-shot reads and writes.
    pub async fn bootstrap_passive() -> Result<Self, Box<dyn std::error::Error>> {
        let ctx = Self::open()?;
        let report = ctx.engine.initialize_passive().await;
        for error in &report.errors {
            tracing::warn!("bootstrap: {}", error);
        }
        Ok(ctx)
    }
}

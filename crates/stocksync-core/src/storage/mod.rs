mod config;
pub mod local_store;
pub mod migrations;

pub use config::{Config, RemoteConfig, RetryConfig, StorageConfig, SyncConfig};
pub use local_store::{LocalStore, MergeSummary};

use std::path::PathBuf;

/// Returns `~/.config/stocksync[-dev]/` based on STOCKSYNC_ENV.
///
/// Set STOCKSYNC_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("STOCKSYNC_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("stocksync-dev")
    } else {
        base_dir.join("stocksync")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

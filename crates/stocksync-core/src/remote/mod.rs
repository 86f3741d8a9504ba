//! Remote backend capability.
//!
//! The sync core only ever talks to the backend through [`RemoteBackend`].
//! [`HttpBackend`] is the production adapter; [`MemoryBackend`] is a
//! scriptable in-process backend used by tests.

pub mod http;
pub mod memory;

use async_trait::async_trait;

use crate::model::{Entity, EntityType, QueuedOperation};

pub use http::HttpBackend;
pub use memory::MemoryBackend;

/// Remote call failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Backend rejected request (HTTP {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// True when the failure says nothing about the request itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_) | RemoteError::Timeout(_))
    }
}

/// The operations the sync core needs from a backend.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Lightweight reachability check.
    async fn ping(&self) -> Result<(), RemoteError>;

    /// Full listing of one entity type.
    async fn fetch_all(&self, entity_type: EntityType) -> Result<Vec<Entity>, RemoteError>;

    /// Apply one queued mutation.
    async fn apply(&self, op: &QueuedOperation) -> Result<(), RemoteError>;
}

/// Run a remote future under a deadline, mapping expiry to [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(limit: std::time::Duration, fut: F) -> Result<T, RemoteError>
where
    F: std::future::Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(limit)),
    }
}

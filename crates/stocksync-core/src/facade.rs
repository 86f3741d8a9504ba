//! Single entry point for reading and writing entities.
//!
//! Writes are committed to the local store together with their queued
//! operation; the sync engine delivers them later. Reads are served from the
//! cache and fall back to the backend on a miss while online. Without a usable
//! store every call goes straight to the backend, and a backend failure then
//! fails the call.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::{CoreError, DatabaseError, Result, ValidationError};
use crate::model::{validate_key, validate_payload, Entity, EntityType, OperationKind, QueuedOperation};
use crate::remote::{with_timeout, RemoteError};
use crate::storage::LocalStore;
use crate::sync::{decide_merge, OperatingMode, SyncEngine, SyncStats};

/// What the application shows next to its data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessStatus {
    pub online: bool,
    pub pending_operations: usize,
    pub mode: OperatingMode,
}

/// Where a write ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Committed locally; delivery is pending.
    Queued(QueuedOperation),
    /// Applied directly on the backend (remote-only mode).
    Applied(QueuedOperation),
}

impl WriteOutcome {
    pub fn operation(&self) -> &QueuedOperation {
        match self {
            WriteOutcome::Queued(op) | WriteOutcome::Applied(op) => op,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued(_))
    }
}

/// Outcome of a read fallback.
enum Refresh {
    /// Offline or the backend failed.
    Skipped,
    /// Listing merged into the cache; read it again.
    Merged,
    /// Store went away while merging; answer from the listing.
    Listing(Vec<Entity>),
}

fn sorted(mut listing: Vec<Entity>) -> Vec<Entity> {
    listing.sort_by(|a, b| a.key.cmp(&b.key));
    listing
}

/// Data access facade over a [`SyncEngine`].
#[derive(Clone)]
pub struct DataAccess {
    engine: Arc<SyncEngine>,
}

impl DataAccess {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Run `f` against the store. `Ok(None)` means the store is not usable
    /// (now or after this call degraded it) and the caller should go remote.
    fn local<T>(
        &self,
        f: impl FnOnce(&LocalStore) -> std::result::Result<T, DatabaseError>,
    ) -> Result<Option<T>> {
        if self.engine.mode() == OperatingMode::RemoteOnly {
            return Ok(None);
        }
        match f(self.engine.store()) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_fatal() => {
                self.engine.degrade(&e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_remote(&self, entity_type: EntityType) -> std::result::Result<Vec<Entity>, RemoteError> {
        let timeout = self.engine.config().remote_timeout;
        let result = with_timeout(timeout, self.engine.remote().fetch_all(entity_type)).await;
        if let Err(e) = &result {
            if e.is_connectivity() {
                self.engine.monitor().record(false);
            }
        }
        result
    }

    /// Pull one type into the cache after a local miss.
    async fn refresh(&self, entity_type: EntityType) -> Result<Refresh> {
        if !self.engine.monitor().is_online() {
            return Ok(Refresh::Skipped);
        }
        let listing = match self.fetch_remote(entity_type).await {
            Ok(listing) => listing,
            Err(e) => {
                debug!(%entity_type, "read fallback failed: {}", e);
                return Ok(Refresh::Skipped);
            }
        };
        match self.local(|store| store.merge_remote(entity_type, &listing, decide_merge))? {
            Some(_) => Ok(Refresh::Merged),
            None => Ok(Refresh::Listing(listing)),
        }
    }

    /// One entity by key.
    pub async fn get(&self, entity_type: EntityType, key: &str) -> Result<Option<Entity>> {
        validate_key(key)?;

        if let Some(cached) = self.local(|store| store.read_one(entity_type, key))? {
            if cached.is_some() {
                return Ok(cached);
            }
            return match self.refresh(entity_type).await? {
                Refresh::Skipped => Ok(None),
                Refresh::Merged => Ok(self.local(|store| store.read_one(entity_type, key))?.flatten()),
                Refresh::Listing(listing) => Ok(listing.into_iter().find(|e| e.key == key)),
            };
        }

        let listing = self.fetch_remote(entity_type).await?;
        Ok(listing.into_iter().find(|e| e.key == key))
    }

    /// Every entity of one type, ordered by key.
    pub async fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        if let Some(cached) = self.local(|store| store.read(entity_type))? {
            if !cached.is_empty() {
                return Ok(cached);
            }
            return match self.refresh(entity_type).await? {
                Refresh::Skipped => Ok(cached),
                Refresh::Merged => Ok(self.local(|store| store.read(entity_type))?.unwrap_or_default()),
                Refresh::Listing(listing) => Ok(sorted(listing)),
            };
        }

        Ok(sorted(self.fetch_remote(entity_type).await?))
    }

    /// Create a new entity. Fails if the key already exists locally.
    pub async fn create(&self, entity_type: EntityType, key: &str, payload: Value) -> Result<WriteOutcome> {
        validate_key(key)?;
        validate_payload(entity_type, &payload)?;

        if let Some(Some(_)) = self.local(|store| store.read_one(entity_type, key))? {
            return Err(ValidationError::DuplicateKey {
                entity_type: entity_type.to_string(),
                key: key.to_string(),
            }
            .into());
        }
        self.mutate(QueuedOperation::new(OperationKind::Create, entity_type, key, payload))
            .await
    }

    /// Replace an entity's payload. Creates it if absent.
    pub async fn update(&self, entity_type: EntityType, key: &str, payload: Value) -> Result<WriteOutcome> {
        validate_key(key)?;
        validate_payload(entity_type, &payload)?;
        self.mutate(QueuedOperation::new(OperationKind::Update, entity_type, key, payload))
            .await
    }

    pub async fn delete(&self, entity_type: EntityType, key: &str) -> Result<WriteOutcome> {
        validate_key(key)?;
        self.mutate(QueuedOperation::new(OperationKind::Delete, entity_type, key, Value::Null))
            .await
    }

    async fn mutate(&self, op: QueuedOperation) -> Result<WriteOutcome> {
        let pending = op.clone();
        if let Some(stored) = self.local(move |store| store.commit_mutation(pending))? {
            debug!(op_id = %stored.id, kind = %stored.kind, key = %stored.entity_key, "mutation queued");
            return Ok(WriteOutcome::Queued(stored));
        }

        let timeout = self.engine.config().remote_timeout;
        match with_timeout(timeout, self.engine.remote().apply(&op)).await {
            Ok(()) => {
                debug!(op_id = %op.id, kind = %op.kind, "mutation applied remotely");
                Ok(WriteOutcome::Applied(op))
            }
            Err(e) => {
                if e.is_connectivity() {
                    self.engine.monitor().record(false);
                }
                Err(CoreError::Remote(e))
            }
        }
    }

    pub fn status(&self) -> AccessStatus {
        let stats = self.engine.stats();
        AccessStatus {
            online: stats.online,
            pending_operations: stats.pending_operations,
            mode: stats.mode,
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }
}

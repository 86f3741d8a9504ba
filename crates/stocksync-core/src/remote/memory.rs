//! In-process backend with failure and latency injection.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{RemoteBackend, RemoteError};
use crate::model::{Entity, EntityType, OperationKind, QueuedOperation};

#[derive(Default)]
struct Inner {
    entities: BTreeMap<(EntityType, String), Entity>,
    applied: Vec<QueuedOperation>,
    ping_delay: Option<Duration>,
    apply_delay: Option<Duration>,
    reject_reason: Option<String>,
}

/// Scriptable backend that records every applied operation.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    reachable: AtomicBool,
    /// Number of upcoming `apply` calls to reject.
    failures_left: AtomicU32,
    /// Number of upcoming `fetch_all` calls to answer with HTTP 500.
    fetch_failures_left: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reachable: AtomicBool::new(true),
            failures_left: AtomicU32::new(0),
            fetch_failures_left: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate network loss or recovery.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every ping by `delay` (used to exercise probe timeouts).
    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        self.lock().ping_delay = delay;
    }

    /// Delay every apply by `delay`.
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        self.lock().apply_delay = delay;
    }

    /// Reject the next `count` applies with HTTP 422.
    pub fn fail_next_applies(&self, count: u32, reason: &str) {
        self.lock().reject_reason = Some(reason.to_string());
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Answer the next `count` listings with HTTP 500.
    pub fn fail_next_fetches(&self, count: u32, reason: &str) {
        self.lock().reject_reason = Some(reason.to_string());
        self.fetch_failures_left.store(count, Ordering::SeqCst);
    }

    /// Put an entity on the backend side directly.
    pub fn seed(&self, entity: Entity) {
        self.lock()
            .entities
            .insert((entity.entity_type, entity.key.clone()), entity);
    }

    /// Remove an entity on the backend side directly.
    pub fn unseed(&self, entity_type: EntityType, key: &str) {
        self.lock().entities.remove(&(entity_type, key.to_string()));
    }

    pub fn entity(&self, entity_type: EntityType, key: &str) -> Option<Entity> {
        self.lock().entities.get(&(entity_type, key.to_string())).cloned()
    }

    /// Every successfully applied operation, in application order.
    pub fn applied(&self) -> Vec<QueuedOperation> {
        self.lock().applied.clone()
    }

    pub fn apply_count(&self) -> usize {
        self.lock().applied.len()
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("connection refused".into()))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn ping(&self) -> Result<(), RemoteError> {
        let delay = self.lock().ping_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable()
    }

    async fn fetch_all(&self, entity_type: EntityType) -> Result<Vec<Entity>, RemoteError> {
        self.check_reachable()?;
        let rejected = self
            .fetch_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let inner = self.lock();
        if rejected {
            let reason = inner.reject_reason.clone().unwrap_or_else(|| "server error".into());
            return Err(RemoteError::Rejected { status: 500, reason });
        }
        Ok(inner
            .entities
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn apply(&self, op: &QueuedOperation) -> Result<(), RemoteError> {
        let delay = self.lock().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable()?;

        let rejected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let mut inner = self.lock();
        if rejected {
            let reason = inner.reject_reason.clone().unwrap_or_else(|| "rejected".into());
            return Err(RemoteError::Rejected { status: 422, reason });
        }

        let key = (op.entity_type, op.entity_key.clone());
        match op.kind {
            OperationKind::Create | OperationKind::Update => {
                let version = inner.entities.get(&key).map_or(0, |e| e.version) + 1;
                inner.entities.insert(
                    key,
                    Entity {
                        entity_type: op.entity_type,
                        key: op.entity_key.clone(),
                        payload: op.payload.clone(),
                        version,
                        updated_at: Utc::now(),
                    },
                );
            }
            OperationKind::Delete => {
                inner.entities.remove(&key);
            }
        }
        inner.applied.push(op.clone());
        Ok(())
    }
}

//! Durable FIFO of local mutations awaiting remote confirmation.
//!
//! The queue is a view over the `operations` table of the [`LocalStore`]:
//! nothing is held in memory, so a restart resumes exactly where the previous
//! process stopped. Failed deliveries stay in place with a backoff deadline;
//! once the retry budget is exhausted the operation turns *dead* and is left
//! out of automatic delivery until [`OperationQueue::requeue`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::model::{EntityType, OperationState, QueuedOperation};
use crate::storage::LocalStore;

/// Backoff schedule for failed deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after which an operation is dead.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, after `attempts` failures.
    ///
    /// `base * factor^(attempts - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Result of recording a failed delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Will be retried once `next_attempt_at` has passed.
    Retry {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry budget exhausted.
    Dead { attempts: u32 },
}

/// Operation queue persisted in the local store.
#[derive(Clone)]
pub struct OperationQueue {
    store: Arc<LocalStore>,
    policy: RetryPolicy,
}

impl OperationQueue {
    pub fn new(store: Arc<LocalStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Append an operation at the tail. Returns it with its `seq` assigned.
    pub fn enqueue(&self, mut op: QueuedOperation) -> Result<QueuedOperation, DatabaseError> {
        op.seq = self.store.insert_operation(&op)?;
        debug!(op_id = %op.id, seq = op.seq, kind = %op.kind, "operation enqueued");
        Ok(op)
    }

    /// Up to `n` live operations, oldest first. Nothing is removed.
    ///
    /// Operations queued behind a dead one on the same key are held back, so
    /// a requeued operation is still delivered before its successors.
    pub fn peek_batch(&self, n: usize) -> Result<Vec<QueuedOperation>, DatabaseError> {
        self.store.list_deliverable(n)
    }

    /// Remove a confirmed operation. Returns `false` if it was already gone.
    pub fn ack(&self, id: &str) -> Result<bool, DatabaseError> {
        let removed = self.store.delete_operation(id)?;
        if removed {
            debug!(op_id = %id, "operation acknowledged");
        }
        Ok(removed)
    }

    /// Record a failed delivery attempt.
    pub fn fail(&self, id: &str, error: &str) -> Result<FailOutcome, DatabaseError> {
        self.fail_at(id, error, Utc::now())
    }

    pub(crate) fn fail_at(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, DatabaseError> {
        let mut op = self
            .store
            .get_operation(id)?
            .ok_or_else(|| DatabaseError::NotFound(format!("queued operation '{id}'")))?;

        op.attempts = op.attempts.saturating_add(1);
        op.last_error = Some(error.to_string());

        let outcome = if op.attempts >= self.policy.max_attempts {
            op.state = OperationState::Dead;
            op.next_attempt_at = None;
            warn!(op_id = %op.id, attempts = op.attempts, "operation dead: {}", error);
            FailOutcome::Dead { attempts: op.attempts }
        } else {
            let delay = self.policy.delay_for(op.attempts);
            let next = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
            op.next_attempt_at = Some(next);
            debug!(
                op_id = %op.id,
                attempts = op.attempts,
                retry_in_ms = delay.as_millis() as u64,
                "operation failed: {}",
                error
            );
            FailOutcome::Retry {
                attempts: op.attempts,
                next_attempt_at: next,
            }
        };

        self.store.update_operation(&op)?;
        Ok(outcome)
    }

    /// Number of live (non-dead) operations.
    pub fn size(&self) -> Result<usize, DatabaseError> {
        self.store.count_operations(OperationState::Pending)
    }

    pub fn dead_count(&self) -> Result<usize, DatabaseError> {
        self.store.count_operations(OperationState::Dead)
    }

    pub fn pending_operations(&self) -> Result<Vec<QueuedOperation>, DatabaseError> {
        self.store.list_operations(OperationState::Pending, None)
    }

    pub fn dead_operations(&self) -> Result<Vec<QueuedOperation>, DatabaseError> {
        self.store.list_operations(OperationState::Dead, None)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedOperation>, DatabaseError> {
        self.store.get_operation(id)
    }

    /// Move a dead operation back into delivery with a fresh retry budget.
    ///
    /// It keeps its original position in the FIFO. Returns `false` if no dead
    /// operation has this id.
    pub fn requeue(&self, id: &str) -> Result<bool, DatabaseError> {
        let Some(mut op) = self.store.get_operation(id)? else {
            return Ok(false);
        };
        if !op.is_dead() {
            return Ok(false);
        }
        op.state = OperationState::Pending;
        op.attempts = 0;
        op.next_attempt_at = None;
        self.store.update_operation(&op)?;
        debug!(op_id = %id, seq = op.seq, "dead operation requeued");
        Ok(true)
    }

    /// Whether any operation, live or dead, references this key.
    pub fn has_pending_for(&self, entity_type: EntityType, key: &str) -> Result<bool, DatabaseError> {
        self.store.has_queued_for(entity_type, key)
    }
}

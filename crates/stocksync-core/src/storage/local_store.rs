//! SQLite-backed local durable store.
//!
//! Holds the entity cache, the operation log backing
//! [`crate::sync::OperationQueue`], and small key-value state such as the
//! last successful sync time.
//!
//! The store can be *unavailable*: it failed to open, or an I/O error degraded
//! it at runtime. Callers check [`LocalStore::is_available`] and fall back to
//! remote-only mode. Degradation is reported once and sticks until
//! [`LocalStore::reset`].

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::migrations;
use crate::error::DatabaseError;
use crate::model::{Entity, EntityType, OperationKind, OperationState, QueuedOperation};
use crate::sync::conflict::MergeDecision;

const LAST_SYNC_KEY: &str = "last_sync_at";

/// Counts from merging one remote listing into the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub upserted: usize,
    pub removed: usize,
    /// Keys left alone because a local operation is still queued for them.
    pub kept_local: usize,
}

/// On-device store for cached entities and queued operations.
pub struct LocalStore {
    conn: Mutex<Option<Connection>>,
    path: Option<PathBuf>,
    degraded_reported: AtomicBool,
}

impl LocalStore {
    /// Open (or create) the database file at `path`.
    ///
    /// The schema is not touched; call [`LocalStore::initialize_schema`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: Some(path),
            degraded_reported: AtomicBool::new(false),
        })
    }

    /// Open `path`, or return an unavailable store if that fails.
    pub fn open_or_unavailable(path: impl AsRef<Path>) -> Self {
        match Self::open(path.as_ref()) {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %path.as_ref().display(), "local store unavailable: {}", e);
                let store = Self::unavailable();
                store.degraded_reported.store(true, Ordering::SeqCst);
                Self {
                    path: Some(path.as_ref().to_path_buf()),
                    ..store
                }
            }
        }
    }

    /// Open a private in-memory database.
    pub fn open_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: None,
            degraded_reported: AtomicBool::new(false),
        })
    }

    /// A store with no backing database (remote-only mode).
    pub fn unavailable() -> Self {
        Self {
            conn: Mutex::new(None),
            path: None,
            degraded_reported: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the backing database is usable.
    pub fn is_available(&self) -> bool {
        self.lock().is_some()
    }

    /// Create or upgrade the schema. Safe to call on every startup.
    pub fn initialize_schema(&self) -> Result<(), DatabaseError> {
        self.with_conn(|conn| {
            migrations::migrate(conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))
        })
    }

    /// Drop the connection and switch to remote-only mode.
    ///
    /// Returns `true` the first time, so the caller reports the degradation once.
    pub fn mark_unavailable(&self, reason: &DatabaseError) -> bool {
        self.lock().take();
        let first = !self.degraded_reported.swap(true, Ordering::SeqCst);
        if first {
            warn!("local store degraded, switching to remote-only mode: {}", reason);
        }
        first
    }

    /// Reopen a degraded file-backed store.
    pub fn reset(&self) -> Result<(), DatabaseError> {
        let path = self.path.as_ref().ok_or(DatabaseError::Unavailable)?;
        let conn = open_connection(path)?;
        migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        *self.lock() = Some(conn);
        self.degraded_reported.store(false, Ordering::SeqCst);
        info!(path = %path.display(), "local store reset");
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(DatabaseError::Unavailable)?;
        f(conn)
    }

    // === Entities ===

    /// All cached entities of one type, ordered by key.
    pub fn read(&self, entity_type: EntityType) -> Result<Vec<Entity>, DatabaseError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, entity_key, payload, version, updated_at
                 FROM entities WHERE entity_type = ?1 ORDER BY entity_key",
            )?;
            let rows = stmt.query_map(params![entity_type.as_str()], RawEntity::from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.decode()?);
            }
            Ok(out)
        })
    }

    pub fn read_one(&self, entity_type: EntityType, key: &str) -> Result<Option<Entity>, DatabaseError> {
        self.with_conn(|conn| read_entity(conn, entity_type, key))
    }

    /// Upsert one entity.
    pub fn write(&self, entity: &Entity) -> Result<(), DatabaseError> {
        self.with_conn(|conn| upsert_entity(conn, entity))
    }

    pub fn remove(&self, entity_type: EntityType, key: &str) -> Result<(), DatabaseError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM entities WHERE entity_type = ?1 AND entity_key = ?2",
                params![entity_type.as_str(), key],
            )?;
            Ok(())
        })
    }

    /// Commit a local mutation and queue it, in one transaction.
    ///
    /// Create/update write the payload with the next local version; delete
    /// removes the cached row. The queued operation gets its `seq` here.
    pub fn commit_mutation(&self, mut op: QueuedOperation) -> Result<QueuedOperation, DatabaseError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            match op.kind {
                OperationKind::Create | OperationKind::Update => {
                    let version = read_entity(&tx, op.entity_type, &op.entity_key)?
                        .map_or(0, |e| e.version)
                        + 1;
                    upsert_entity(
                        &tx,
                        &Entity {
                            entity_type: op.entity_type,
                            key: op.entity_key.clone(),
                            payload: op.payload.clone(),
                            version,
                            updated_at: op.created_at,
                        },
                    )?;
                }
                OperationKind::Delete => {
                    tx.execute(
                        "DELETE FROM entities WHERE entity_type = ?1 AND entity_key = ?2",
                        params![op.entity_type.as_str(), op.entity_key],
                    )?;
                }
            }
            op.seq = insert_operation(&tx, &op)?;
            tx.commit()?;
            Ok(op)
        })
    }

    /// Merge a remote listing of `entity_type` into the cache.
    ///
    /// Runs in one transaction so a concurrent local mutation cannot slip in
    /// between the pending-operation check and the overwrite.
    pub fn merge_remote(
        &self,
        entity_type: EntityType,
        remote: &[Entity],
        decide: impl Fn(Option<&Entity>, Option<&Entity>, bool) -> MergeDecision,
    ) -> Result<MergeSummary, DatabaseError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let queued = queued_keys(&tx, entity_type)?;

            let mut local_keys: HashSet<String> = HashSet::new();
            {
                let mut stmt = tx.prepare("SELECT entity_key FROM entities WHERE entity_type = ?1")?;
                let rows = stmt.query_map(params![entity_type.as_str()], |row| row.get::<_, String>(0))?;
                for row in rows {
                    local_keys.insert(row?);
                }
            }

            let mut summary = MergeSummary::default();
            let mut seen = HashSet::new();
            for incoming in remote {
                seen.insert(incoming.key.clone());
                let local = read_entity(&tx, entity_type, &incoming.key)?;
                let pending = queued.contains(&incoming.key);
                match decide(local.as_ref(), Some(incoming), pending) {
                    MergeDecision::TakeRemote => {
                        upsert_entity(&tx, incoming)?;
                        summary.upserted += 1;
                    }
                    MergeDecision::KeepLocal => summary.kept_local += 1,
                    MergeDecision::RemoveLocal => {
                        delete_entity(&tx, entity_type, &incoming.key)?;
                        summary.removed += 1;
                    }
                    MergeDecision::Unchanged => {}
                }
            }

            for key in local_keys.difference(&seen) {
                let local = read_entity(&tx, entity_type, key)?;
                let pending = queued.contains(key);
                match decide(local.as_ref(), None, pending) {
                    MergeDecision::RemoveLocal => {
                        delete_entity(&tx, entity_type, key)?;
                        summary.removed += 1;
                    }
                    MergeDecision::KeepLocal => summary.kept_local += 1,
                    MergeDecision::TakeRemote | MergeDecision::Unchanged => {}
                }
            }

            tx.commit()?;
            debug!(
                entity_type = %entity_type,
                upserted = summary.upserted,
                removed = summary.removed,
                kept_local = summary.kept_local,
                "merged remote listing"
            );
            Ok(summary)
        })
    }

    // === Operation log ===

    pub fn insert_operation(&self, op: &QueuedOperation) -> Result<i64, DatabaseError> {
        self.with_conn(|conn| insert_operation(conn, op))
    }

    /// Operations in `state`, oldest first, at most `limit`.
    pub fn list_operations(
        &self,
        state: OperationState,
        limit: Option<usize>,
    ) -> Result<Vec<QueuedOperation>, DatabaseError> {
        self.with_conn(|conn| {
            let limit = limit.map_or(-1, |n| n as i64);
            let mut stmt = conn.prepare(
                "SELECT seq, id, kind, entity_type, entity_key, payload, created_at,
                        attempts, last_error, next_attempt_at, state
                 FROM operations WHERE state = ?1 ORDER BY seq LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![state.as_str(), limit], RawOperation::from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.decode()?);
            }
            Ok(out)
        })
    }

    /// Pending operations, oldest first, at most `limit`, leaving out any
    /// whose key has an older dead operation. Such a key stays blocked until
    /// the dead one is requeued and delivered.
    pub fn list_deliverable(&self, limit: usize) -> Result<Vec<QueuedOperation>, DatabaseError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT o.seq, o.id, o.kind, o.entity_type, o.entity_key, o.payload, o.created_at,
                        o.attempts, o.last_error, o.next_attempt_at, o.state
                 FROM operations o
                 WHERE o.state = ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM operations d
                       WHERE d.state = ?2
                         AND d.entity_type = o.entity_type
                         AND d.entity_key = o.entity_key
                         AND d.seq < o.seq)
                 ORDER BY o.seq LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![
                    OperationState::Pending.as_str(),
                    OperationState::Dead.as_str(),
                    limit as i64
                ],
                RawOperation::from_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.decode()?);
            }
            Ok(out)
        })
    }

    pub fn get_operation(&self, id: &str) -> Result<Option<QueuedOperation>, DatabaseError> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    "SELECT seq, id, kind, entity_type, entity_key, payload, created_at,
                            attempts, last_error, next_attempt_at, state
                     FROM operations WHERE id = ?1",
                    params![id],
                    RawOperation::from_row,
                )
                .optional()?;
            raw.map(RawOperation::decode).transpose()
        })
    }

    /// Delete an operation; `false` if it was not there.
    pub fn delete_operation(&self, id: &str) -> Result<bool, DatabaseError> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM operations WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    /// Persist retry bookkeeping for one operation.
    pub fn update_operation(&self, op: &QueuedOperation) -> Result<bool, DatabaseError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE operations
                 SET attempts = ?2, last_error = ?3, next_attempt_at = ?4, state = ?5
                 WHERE id = ?1",
                params![
                    op.id,
                    op.attempts,
                    op.last_error,
                    op.next_attempt_at.map(|t| t.to_rfc3339()),
                    op.state.as_str(),
                ],
            )?;
            Ok(n > 0)
        })
    }

    pub fn count_operations(&self, state: OperationState) -> Result<usize, DatabaseError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM operations WHERE state = ?1",
                params![state.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Whether any operation (pending or dead) is queued for this key.
    pub fn has_queued_for(&self, entity_type: EntityType, key: &str) -> Result<bool, DatabaseError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM operations WHERE entity_type = ?1 AND entity_key = ?2",
                params![entity_type.as_str(), key],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    // === Key-value state ===

    pub fn kv_get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?)
        })
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        self.kv_get(LAST_SYNC_KEY)?
            .map(|s| parse_time("kv", &s))
            .transpose()
    }

    pub fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.kv_set(LAST_SYNC_KEY, &at.to_rfc3339())
    }
}

fn open_connection(path: &Path) -> Result<Connection, DatabaseError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    // WAL + FULL: an acknowledged commit survives a crash.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

fn parse_time(table: &'static str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupted {
            table,
            message: format!("bad timestamp '{s}': {e}"),
        })
}

fn parse_entity_type(table: &'static str, s: &str) -> Result<EntityType, DatabaseError> {
    s.parse().map_err(|_| DatabaseError::Corrupted {
        table,
        message: format!("unknown entity type '{s}'"),
    })
}

fn parse_payload(table: &'static str, s: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Corrupted {
        table,
        message: format!("bad payload: {e}"),
    })
}

fn read_entity(conn: &Connection, entity_type: EntityType, key: &str) -> Result<Option<Entity>, DatabaseError> {
    let raw = conn
        .query_row(
            "SELECT entity_type, entity_key, payload, version, updated_at
             FROM entities WHERE entity_type = ?1 AND entity_key = ?2",
            params![entity_type.as_str(), key],
            RawEntity::from_row,
        )
        .optional()?;
    raw.map(RawEntity::decode).transpose()
}

fn upsert_entity(conn: &Connection, entity: &Entity) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO entities (entity_type, entity_key, payload, version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(entity_type, entity_key) DO UPDATE SET
            payload = excluded.payload,
            version = excluded.version,
            updated_at = excluded.updated_at",
        params![
            entity.entity_type.as_str(),
            entity.key,
            entity.payload.to_string(),
            entity.version,
            entity.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn delete_entity(conn: &Connection, entity_type: EntityType, key: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM entities WHERE entity_type = ?1 AND entity_key = ?2",
        params![entity_type.as_str(), key],
    )?;
    Ok(())
}

fn insert_operation(conn: &Connection, op: &QueuedOperation) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO operations
            (id, kind, entity_type, entity_key, payload, created_at,
             attempts, last_error, next_attempt_at, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            op.id,
            op.kind.as_str(),
            op.entity_type.as_str(),
            op.entity_key,
            op.payload.to_string(),
            op.created_at.to_rfc3339(),
            op.attempts,
            op.last_error,
            op.next_attempt_at.map(|t| t.to_rfc3339()),
            op.state.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn queued_keys(conn: &Connection, entity_type: EntityType) -> Result<HashSet<String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT DISTINCT entity_key FROM operations WHERE entity_type = ?1")?;
    let rows = stmt.query_map(params![entity_type.as_str()], |row| row.get::<_, String>(0))?;
    let mut keys = HashSet::new();
    for row in rows {
        keys.insert(row?);
    }
    Ok(keys)
}

struct RawEntity {
    entity_type: String,
    key: String,
    payload: String,
    version: i64,
    updated_at: String,
}

impl RawEntity {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_type: row.get(0)?,
            key: row.get(1)?,
            payload: row.get(2)?,
            version: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<Entity, DatabaseError> {
        Ok(Entity {
            entity_type: parse_entity_type("entities", &self.entity_type)?,
            key: self.key,
            payload: parse_payload("entities", &self.payload)?,
            version: self.version,
            updated_at: parse_time("entities", &self.updated_at)?,
        })
    }
}

struct RawOperation {
    seq: i64,
    id: String,
    kind: String,
    entity_type: String,
    entity_key: String,
    payload: String,
    created_at: String,
    attempts: u32,
    last_error: Option<String>,
    next_attempt_at: Option<String>,
    state: String,
}

impl RawOperation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            kind: row.get(2)?,
            entity_type: row.get(3)?,
            entity_key: row.get(4)?,
            payload: row.get(5)?,
            created_at: row.get(6)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
            next_attempt_at: row.get(9)?,
            state: row.get(10)?,
        })
    }

    fn decode(self) -> Result<QueuedOperation, DatabaseError> {
        let kind = OperationKind::parse(&self.kind).ok_or_else(|| DatabaseError::Corrupted {
            table: "operations",
            message: format!("unknown kind '{}'", self.kind),
        })?;
        let state = match self.state.as_str() {
            "pending" => OperationState::Pending,
            "dead" => OperationState::Dead,
            other => {
                return Err(DatabaseError::Corrupted {
                    table: "operations",
                    message: format!("unknown state '{other}'"),
                })
            }
        };
        Ok(QueuedOperation {
            id: self.id,
            seq: self.seq,
            kind,
            entity_type: parse_entity_type("operations", &self.entity_type)?,
            entity_key: self.entity_key,
            payload: parse_payload("operations", &self.payload)?,
            created_at: parse_time("operations", &self.created_at)?,
            attempts: self.attempts,
            last_error: self.last_error,
            next_attempt_at: self
                .next_attempt_at
                .map(|s| parse_time("operations", &s))
                .transpose()?,
            state,
        })
    }
}

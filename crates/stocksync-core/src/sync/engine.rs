//! Reconciliation orchestration.
//!
//! A pass drains the operation queue oldest-first against the backend, then
//! pulls every configured entity type and merges it into the cache. Passes are
//! triggered by a timer, by every offline to online edge, and on demand; at
//! most one runs at a time and overlapping triggers are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::conflict::decide_merge;
use super::connectivity::ConnectivityMonitor;
use super::queue::{FailOutcome, OperationQueue, RetryPolicy};
use crate::error::{DatabaseError, SyncError};
use crate::events::SyncEvent;
use crate::model::EntityType;
use crate::remote::{with_timeout, RemoteBackend};
use crate::storage::{Config, LocalStore, MergeSummary};

const EVENT_CAPACITY: usize = 256;

/// Engine timers, batching and retry settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub probe_interval: Duration,
    pub reconcile_interval: Duration,
    /// Deadline for every apply and fetch call.
    pub remote_timeout: Duration,
    pub batch_size: usize,
    pub entity_types: Vec<EntityType>,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(5),
            batch_size: 50,
            entity_types: EntityType::all().to_vec(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            probe_interval: config.sync.probe_interval(),
            reconcile_interval: config.sync.reconcile_interval(),
            remote_timeout: Duration::from_secs(config.remote.request_timeout_secs),
            batch_size: config.sync.batch_size.max(1),
            entity_types: config.sync.entity_types.clone(),
            retry: config.retry.policy(),
        }
    }
}

/// Where writes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Local store first, queue drained in the background.
    Local,
    /// No usable local store; every call goes straight to the backend.
    RemoteOnly,
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Local => f.write_str("local"),
            OperatingMode::RemoteOnly => f.write_str("remote-only"),
        }
    }
}

/// Snapshot of the sync state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    pub initialized: bool,
    pub online: bool,
    pub mode: OperatingMode,
    /// Live queued operations (dead ones excluded).
    pub pending_operations: usize,
    pub dead_operations: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotInitialized,
    RemoteOnly,
    Offline,
    /// Another pass was in progress; this trigger was coalesced into it.
    AlreadyRunning,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub applied: usize,
    pub failed: usize,
    /// Operations that exhausted their retry budget during this pass.
    pub dead: usize,
    pub merged: MergeSummary,
    /// Entity types fetched and merged.
    pub pulled_types: usize,
    /// Shutdown was requested before the pass finished.
    pub interrupted: bool,
    pub errors: Vec<SyncError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Completed(PassReport),
    Skipped(SkipReason),
}

impl PassOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            PassOutcome::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            PassOutcome::Completed(_) => None,
            PassOutcome::Skipped(reason) => Some(*reason),
        }
    }
}

/// Result of [`SyncEngine::initialize`]. Bootstrap never fails outright.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapReport {
    pub mode: OperatingMode,
    pub online: bool,
    /// The initial pass, if the backend was reachable.
    pub initial_pass: Option<PassReport>,
    pub errors: Vec<SyncError>,
}

/// How a queue drain ended.
enum DrainEnd {
    Exhausted,
    /// Head of the queue is still inside its backoff window.
    Deferred,
    Failed { connectivity: bool },
    Interrupted,
    StoreError,
}

/// Resets the single-pass flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Long-lived sync service. Share it behind an `Arc`.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    queue: OperationQueue,
    remote: Arc<dyn RemoteBackend>,
    monitor: Arc<ConnectivityMonitor>,
    config: EngineConfig,
    initialized: AtomicBool,
    remote_only: AtomicBool,
    pass_running: AtomicBool,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    /// Last queue counts read successfully, as (pending, dead).
    queue_counts: Mutex<(usize, usize)>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        monitor: Arc<ConnectivityMonitor>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        {
            let events = events.clone();
            monitor.subscribe(move |online| {
                let _ = events.send(SyncEvent::ConnectivityChanged {
                    online,
                    at: Utc::now(),
                });
            });
        }
        Self {
            queue: OperationQueue::new(Arc::clone(&store), config.retry.clone()),
            store,
            remote,
            monitor,
            config,
            initialized: AtomicBool::new(false),
            remote_only: AtomicBool::new(false),
            pass_running: AtomicBool::new(false),
            last_sync_at: Mutex::new(None),
            queue_counts: Mutex::new((0, 0)),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<dyn RemoteBackend> {
        &self.remote
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> OperatingMode {
        if self.remote_only.load(Ordering::SeqCst) {
            OperatingMode::RemoteOnly
        } else {
            OperatingMode::Local
        }
    }

    /// Subscribe to engine events.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_last_sync(&self, at: Option<DateTime<Utc>>) {
        *self.last_sync_at.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    }

    /// Switch to remote-only mode after a store failure. Reported once.
    pub(crate) fn degrade(&self, err: &DatabaseError) {
        self.remote_only.store(true, Ordering::SeqCst);
        if self.store.mark_unavailable(err) {
            error!("local store failure, continuing remote-only: {}", err);
            self.emit(SyncEvent::LocalStoreDegraded {
                reason: err.to_string(),
                at: Utc::now(),
            });
        }
    }

    /// Degrade if `err` is fatal for the store.
    pub(crate) fn handle_store_error(&self, err: &DatabaseError) {
        if err.is_fatal() {
            self.degrade(err);
        } else {
            warn!("transient local store error: {}", err);
        }
    }

    /// Reopen a degraded store and leave remote-only mode.
    pub fn reset_store(&self) -> Result<(), DatabaseError> {
        self.store.reset()?;
        self.set_last_sync(self.store.last_sync_at().unwrap_or(None));
        self.remote_only.store(false, Ordering::SeqCst);
        info!("local store restored");
        self.emit(SyncEvent::LocalStoreRestored { at: Utc::now() });
        Ok(())
    }

    /// Bring the engine up.
    ///
    /// An unavailable store selects remote-only mode; otherwise the schema is
    /// initialized and, if the backend answers, a first pass runs. Neither a
    /// store failure nor a failed pull prevents initialization.
    pub async fn initialize(&self) -> BootstrapReport {
        self.bootstrap(true).await
    }

    /// Like [`SyncEngine::initialize`], but never runs the initial pass.
    ///
    /// For short-lived callers that only read or queue.
    pub async fn initialize_passive(&self) -> BootstrapReport {
        self.bootstrap(false).await
    }

    async fn bootstrap(&self, run_initial_pass: bool) -> BootstrapReport {
        let mut errors = Vec::new();

        if !self.store.is_available() {
            errors.push(SyncError::Bootstrap("local store unavailable".into()));
            self.degrade(&DatabaseError::Unavailable);
        } else if let Err(e) = self.store.initialize_schema() {
            errors.push(SyncError::Bootstrap(format!("schema initialization failed: {e}")));
            self.degrade(&e);
        } else {
            match self.store.last_sync_at() {
                Ok(at) => self.set_last_sync(at),
                Err(e) => warn!("could not read last sync time: {}", e),
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        let mode = self.mode();
        let online = self.monitor.probe().await;

        let initial_pass = if run_initial_pass && mode == OperatingMode::Local && online {
            self.run_guarded(false).await.report().cloned()
        } else {
            None
        };
        if let Some(pass) = &initial_pass {
            errors.extend(pass.errors.iter().cloned());
        }

        info!(%mode, online, "sync engine initialized");
        self.emit(SyncEvent::Bootstrapped {
            mode,
            at: Utc::now(),
        });

        BootstrapReport {
            mode,
            online,
            initial_pass,
            errors,
        }
    }

    /// Run a pass if online and none is in progress.
    pub async fn reconcile(&self) -> PassOutcome {
        self.run_guarded(false).await
    }

    /// Run a pass now. Probes first when currently offline.
    pub async fn force_sync(&self) -> PassOutcome {
        if !self.monitor.is_online() {
            self.monitor.probe().await;
        }
        self.run_guarded(true).await
    }

    async fn run_guarded(&self, forced: bool) -> PassOutcome {
        if !self.is_initialized() {
            return PassOutcome::Skipped(SkipReason::NotInitialized);
        }
        if self.mode() == OperatingMode::RemoteOnly {
            return PassOutcome::Skipped(SkipReason::RemoteOnly);
        }
        if !self.monitor.is_online() {
            debug!("offline, pass skipped");
            return PassOutcome::Skipped(SkipReason::Offline);
        }
        let Some(_guard) = PassGuard::try_acquire(&self.pass_running) else {
            debug!("pass already running, trigger coalesced");
            return PassOutcome::Skipped(SkipReason::AlreadyRunning);
        };
        PassOutcome::Completed(self.run_pass(forced).await)
    }

    async fn run_pass(&self, forced: bool) -> PassReport {
        let started = Utc::now();
        debug!(forced, "reconciliation pass started");
        self.emit(SyncEvent::PassStarted { forced, at: started });

        let mut report = PassReport::default();
        let pull = match self.drain(&mut report).await {
            DrainEnd::Exhausted | DrainEnd::Deferred | DrainEnd::Failed { connectivity: false } => true,
            DrainEnd::Failed { connectivity: true } | DrainEnd::StoreError => false,
            DrainEnd::Interrupted => {
                report.interrupted = true;
                false
            }
        };

        if pull && self.pull(&mut report).await {
            let now = Utc::now();
            self.set_last_sync(Some(now));
            if let Err(e) = self.store.set_last_sync_at(now) {
                self.handle_store_error(&e);
            }
        }

        info!(
            applied = report.applied,
            failed = report.failed,
            dead = report.dead,
            upserted = report.merged.upserted,
            removed = report.merged.removed,
            "reconciliation pass finished"
        );
        self.emit(SyncEvent::PassCompleted {
            applied: report.applied,
            failed: report.failed,
            upserted: report.merged.upserted,
            removed: report.merged.removed,
            at: Utc::now(),
        });
        report
    }

    fn store_failed(&self, err: DatabaseError, report: &mut PassReport) {
        self.handle_store_error(&err);
        report.errors.push(err.into());
    }

    /// Deliver queued operations until the queue is empty, the head is not
    /// yet due, or a delivery fails. Stopping at the first failure keeps
    /// later operations on the same key behind it.
    async fn drain(&self, report: &mut PassReport) -> DrainEnd {
        loop {
            let batch = match self.queue.peek_batch(self.config.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    self.store_failed(e, report);
                    return DrainEnd::StoreError;
                }
            };
            if batch.is_empty() {
                return DrainEnd::Exhausted;
            }
            let full = batch.len() >= self.config.batch_size;

            for op in batch {
                if self.shutdown.is_cancelled() {
                    return DrainEnd::Interrupted;
                }
                if !op.is_due(Utc::now()) {
                    debug!(op_id = %op.id, "queue head in backoff");
                    return DrainEnd::Deferred;
                }

                match with_timeout(self.config.remote_timeout, self.remote.apply(&op)).await {
                    Ok(()) => {
                        if let Err(e) = self.queue.ack(&op.id) {
                            self.store_failed(e, report);
                            return DrainEnd::StoreError;
                        }
                        report.applied += 1;
                        self.emit(SyncEvent::OperationAcked {
                            op_id: op.id.clone(),
                            kind: op.kind,
                            entity_type: op.entity_type,
                            entity_key: op.entity_key.clone(),
                        });
                    }
                    Err(remote_err) => {
                        report.failed += 1;
                        let reason = remote_err.to_string();
                        let connectivity = remote_err.is_connectivity();

                        match self.queue.fail(&op.id, &reason) {
                            Ok(FailOutcome::Retry {
                                attempts,
                                next_attempt_at,
                            }) => {
                                self.emit(SyncEvent::OperationFailed {
                                    op_id: op.id.clone(),
                                    attempts,
                                    error: reason.clone(),
                                    next_attempt_at,
                                });
                            }
                            Ok(FailOutcome::Dead { attempts }) => {
                                report.dead += 1;
                                self.emit(SyncEvent::OperationDead {
                                    op_id: op.id.clone(),
                                    entity_type: op.entity_type,
                                    entity_key: op.entity_key.clone(),
                                    attempts,
                                    error: reason.clone(),
                                });
                            }
                            Err(e) => {
                                self.store_failed(e, report);
                                return DrainEnd::StoreError;
                            }
                        }

                        report.errors.push(if connectivity {
                            SyncError::Connectivity(reason)
                        } else {
                            SyncError::QueueApply {
                                op_id: op.id.clone(),
                                reason,
                            }
                        });
                        if connectivity {
                            self.monitor.record(false);
                        }
                        return DrainEnd::Failed { connectivity };
                    }
                }
            }

            if !full {
                return DrainEnd::Exhausted;
            }
        }
    }

    /// Fetch and merge every configured type. Returns `true` if all of them
    /// were merged.
    async fn pull(&self, report: &mut PassReport) -> bool {
        let mut complete = true;
        for &entity_type in &self.config.entity_types {
            if self.shutdown.is_cancelled() {
                report.interrupted = true;
                return false;
            }

            let listing =
                match with_timeout(self.config.remote_timeout, self.remote.fetch_all(entity_type)).await {
                    Ok(listing) => listing,
                    Err(e) if e.is_connectivity() => {
                        self.monitor.record(false);
                        report.errors.push(SyncError::Connectivity(e.to_string()));
                        return false;
                    }
                    Err(e) => {
                        warn!(%entity_type, "pull failed: {}", e);
                        report.errors.push(SyncError::Pull {
                            entity_type: entity_type.to_string(),
                            reason: e.to_string(),
                        });
                        complete = false;
                        continue;
                    }
                };

            match self.store.merge_remote(entity_type, &listing, decide_merge) {
                Ok(summary) => {
                    report.merged.upserted += summary.upserted;
                    report.merged.removed += summary.removed;
                    report.merged.kept_local += summary.kept_local;
                    report.pulled_types += 1;
                }
                Err(e) => {
                    self.store_failed(e, report);
                    return false;
                }
            }
        }
        complete
    }

    /// Queue depth, falling back to the last successful read when the store
    /// cannot answer right now.
    fn queue_counts(&self) -> (usize, usize) {
        let mut cached = self
            .queue_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match self.queue.size().and_then(|p| Ok((p, self.queue.dead_count()?))) {
            Ok(counts) => {
                *cached = counts;
                counts
            }
            Err(e) => {
                warn!(
                    pending = cached.0,
                    dead = cached.1,
                    "queue counts unavailable, reporting last known: {}",
                    e
                );
                *cached
            }
        }
    }

    /// Current state snapshot.
    pub fn stats(&self) -> SyncStats {
        let mode = self.mode();
        let (pending_operations, dead_operations) = match mode {
            OperatingMode::Local => self.queue_counts(),
            OperatingMode::RemoteOnly => (0, 0),
        };
        SyncStats {
            initialized: self.is_initialized(),
            online: self.monitor.is_online(),
            mode,
            pending_operations,
            dead_operations,
            last_sync: self.last_sync(),
        }
    }

    /// Spawn the connectivity ticker and the reconciliation loop.
    ///
    /// The engine does not restart after [`SyncHandle::shutdown`].
    pub fn start(self: Arc<Self>) -> SyncHandle {
        let token = self.shutdown.clone();
        let monitor_task =
            Arc::clone(&self.monitor).spawn(self.config.probe_interval, token.child_token());
        let engine = Arc::clone(&self);
        let loop_task = tokio::spawn(async move { engine.reconcile_loop().await });
        info!(
            probe_interval_secs = self.config.probe_interval.as_secs(),
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "sync engine started"
        );
        SyncHandle {
            token,
            tasks: vec![monitor_task, loop_task],
        }
    }

    async fn reconcile_loop(self: Arc<Self>) {
        let period = self.config.reconcile_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut online_rx = self.monitor.watch();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online_rx.borrow_and_update() {
                        debug!("connectivity restored, reconciling");
                        self.reconcile().await;
                    }
                }
            }
        }
        debug!("reconciliation loop stopped");
    }
}

/// Handle to the background tasks started by [`SyncEngine::start`].
pub struct SyncHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Stop the timers and wait for them. An in-flight delivery completes;
    /// the rest of its batch stays queued.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("sync task ended abnormally: {}", e);
            }
        }
        info!("sync engine stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, OperationKind, QueuedOperation};
    use crate::remote::MemoryBackend;
    use serde_json::json;

    struct Harness {
        backend: Arc<MemoryBackend>,
        engine: Arc<SyncEngine>,
    }

    fn harness_with(store: LocalStore) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let remote: Arc<dyn RemoteBackend> = Arc::clone(&backend) as Arc<dyn RemoteBackend>;
        let monitor = Arc::new(ConnectivityMonitor::new(Arc::clone(&remote), Duration::from_secs(5)));
        let config = EngineConfig {
            retry: RetryPolicy {
                base_delay: Duration::ZERO,
                ..RetryPolicy::default()
            },
            ..EngineConfig::default()
        };
        let engine = Arc::new(SyncEngine::new(Arc::new(store), remote, monitor, config));
        Harness { backend, engine }
    }

    fn harness() -> Harness {
        harness_with(LocalStore::open_memory().unwrap())
    }

    fn create(key: &str) -> QueuedOperation {
        QueuedOperation::new(
            OperationKind::Create,
            EntityType::Material,
            key,
            json!({"name": "Flour"}),
        )
    }

    #[tokio::test]
    async fn pass_skipped_before_initialize() {
        let h = harness();
        assert_eq!(
            h.engine.reconcile().await,
            PassOutcome::Skipped(SkipReason::NotInitialized)
        );
    }

    #[tokio::test]
    async fn initialize_pulls_remote_state() {
        let h = harness();
        h.backend
            .seed(Entity::new(EntityType::Product, "P1", json!({"name": "Bread"})));

        let report = h.engine.initialize().await;
        assert_eq!(report.mode, OperatingMode::Local);
        assert!(report.online);
        assert!(report.errors.is_empty());
        assert_eq!(report.initial_pass.unwrap().merged.upserted, 1);

        let cached = h.engine.store().read_one(EntityType::Product, "P1").unwrap();
        assert!(cached.is_some());
        assert!(h.engine.stats().last_sync.is_some());
    }

    #[tokio::test]
    async fn passive_initialize_leaves_queue_alone() {
        let h = harness();
        h.engine.store().initialize_schema().unwrap();
        h.engine.queue().enqueue(create("M1")).unwrap();

        let report = h.engine.initialize_passive().await;
        assert!(report.online);
        assert!(report.initial_pass.is_none());
        assert!(h.engine.is_initialized());
        assert_eq!(h.backend.apply_count(), 0);
        assert_eq!(h.engine.stats().pending_operations, 1);
    }

    #[tokio::test]
    async fn stats_keep_last_counts_when_store_cannot_answer() {
        let h = harness();
        h.backend.set_reachable(false);
        h.engine.initialize().await;
        h.engine.queue().enqueue(create("M1")).unwrap();
        h.engine.queue().enqueue(create("M2")).unwrap();
        assert_eq!(h.engine.stats().pending_operations, 2);

        // Store stops answering without the engine switching modes.
        h.engine.store().mark_unavailable(&DatabaseError::Locked);
        let stats = h.engine.stats();
        assert_eq!(stats.mode, OperatingMode::Local);
        assert_eq!(stats.pending_operations, 2);
    }

    #[tokio::test]
    async fn rejected_listing_is_reported_as_pull_error() {
        let h = harness();
        h.backend.fail_next_fetches(1, "HTTP 500");
        let report = h.engine.initialize().await;
        let pass = report.initial_pass.unwrap();
        assert!(matches!(
            pass.errors[0],
            SyncError::Pull { ref entity_type, .. } if entity_type == "material"
        ));
        assert!(h.engine.monitor().is_online());
    }

    #[tokio::test]
    async fn unreachable_backend_does_not_block_initialize() {
        let h = harness();
        h.backend.set_reachable(false);
        let report = h.engine.initialize().await;
        assert!(!report.online);
        assert!(report.initial_pass.is_none());
        assert!(h.engine.stats().initialized);
        assert_eq!(
            h.engine.reconcile().await,
            PassOutcome::Skipped(SkipReason::Offline)
        );
    }

    #[tokio::test]
    async fn unavailable_store_selects_remote_only() {
        let h = harness_with(LocalStore::unavailable());
        let mut events = h.engine.events();
        let report = h.engine.initialize().await;

        assert_eq!(report.mode, OperatingMode::RemoteOnly);
        assert!(matches!(report.errors[0], SyncError::Bootstrap(_)));
        assert!(h.engine.is_initialized());
        assert_eq!(
            h.engine.force_sync().await,
            PassOutcome::Skipped(SkipReason::RemoteOnly)
        );

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"LocalStoreDegraded"));
        assert!(names.contains(&"Bootstrapped"));
    }

    #[tokio::test]
    async fn rejected_operation_blocks_later_ones() {
        let h = harness();
        h.engine.initialize().await;
        let first = h.engine.queue().enqueue(create("M1")).unwrap();
        h.engine.queue().enqueue(create("M2")).unwrap();

        h.backend.fail_next_applies(1, "validation failed");
        let report = h.engine.force_sync().await.report().cloned().unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.failed, 1);
        assert!(matches!(report.errors[0], SyncError::QueueApply { ref op_id, .. } if *op_id == first.id));

        let report = h.engine.force_sync().await.report().cloned().unwrap();
        assert_eq!(report.applied, 2);
        let applied: Vec<String> = h.backend.applied().into_iter().map(|op| op.entity_key).collect();
        assert_eq!(applied, vec!["M1", "M2"]);
    }

    #[tokio::test]
    async fn connectivity_failure_flips_offline() {
        let h = harness();
        h.engine.initialize().await;
        h.engine.queue().enqueue(create("M1")).unwrap();

        h.backend.set_reachable(false);
        let report = h.engine.reconcile().await.report().cloned().unwrap();
        assert!(matches!(report.errors[0], SyncError::Connectivity(_)));
        assert_eq!(report.pulled_types, 0);
        assert!(!h.engine.monitor().is_online());
        assert_eq!(h.engine.stats().pending_operations, 1);
    }

    #[tokio::test]
    async fn backoff_defers_queue_head() {
        let backend = Arc::new(MemoryBackend::new());
        let remote: Arc<dyn RemoteBackend> = Arc::clone(&backend) as Arc<dyn RemoteBackend>;
        let monitor = Arc::new(ConnectivityMonitor::new(Arc::clone(&remote), Duration::from_secs(5)));
        let engine = SyncEngine::new(
            Arc::new(LocalStore::open_memory().unwrap()),
            remote,
            monitor,
            EngineConfig::default(),
        );
        engine.initialize().await;
        engine.queue().enqueue(create("M1")).unwrap();

        backend.fail_next_applies(1, "busy");
        engine.force_sync().await;
        // One second backoff has not elapsed yet.
        let report = engine.force_sync().await.report().cloned().unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(backend.apply_count(), 0);
        assert_eq!(engine.stats().pending_operations, 1);
    }

    #[test]
    fn pass_guard_coalesces() {
        let flag = AtomicBool::new(false);
        let guard = PassGuard::try_acquire(&flag).unwrap();
        assert!(PassGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(PassGuard::try_acquire(&flag).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_reconciles_after_reconnect() {
        let h = harness();
        h.backend.set_reachable(false);
        h.engine.initialize().await;
        h.engine.queue().enqueue(create("M1")).unwrap();

        let handle = Arc::clone(&h.engine).start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.backend.apply_count(), 0);

        h.backend.set_reachable(true);
        // Next probe tick sees the backend and the edge triggers a pass.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.backend.apply_count(), 1);
        assert_eq!(h.engine.stats().pending_operations, 0);

        handle.shutdown().await;
    }
}

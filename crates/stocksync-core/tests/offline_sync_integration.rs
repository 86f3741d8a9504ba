//! End-to-end offline/online behavior of the sync subsystem.
//!
//! Every test drives the public facade and engine against the in-memory
//! backend, toggling its reachability to simulate network loss.

mod common;

use common::{drain_events, fast_retry_config, fixture, fixture_with};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stocksync_core::{
    Entity, EntityType, LocalStore, MemoryBackend, OperatingMode, OperationKind, PassOutcome,
    SkipReason, SyncError, SyncEvent,
};

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn offline_create_is_delivered_after_reconnect() {
    let fx = fixture(false).await;

    fx.access
        .create(EntityType::Material, "M1", json!({"name": "Flour"}))
        .await
        .unwrap();
    assert_eq!(fx.access.status().pending_operations, 1);
    assert!(!fx.access.status().online);

    fx.backend.set_reachable(true);
    let outcome = fx.engine.force_sync().await;
    assert_eq!(outcome.report().unwrap().applied, 1);

    assert_eq!(fx.access.status().pending_operations, 0);
    let remote = fx.backend.entity(EntityType::Material, "M1").unwrap();
    assert_eq!(remote.payload, json!({"name": "Flour"}));
}

#[tokio::test]
async fn two_offline_updates_arrive_in_order() {
    let fx = fixture(true).await;
    fx.backend
        .seed(Entity::new(EntityType::Material, "M1", json!({"name": "Flour", "qty": 0})));
    fx.engine.force_sync().await;
    fx.backend.set_reachable(false);

    fx.access
        .update(EntityType::Material, "M1", json!({"name": "Flour", "qty": 10}))
        .await
        .unwrap();
    fx.access
        .update(EntityType::Material, "M1", json!({"name": "Flour", "qty": 15}))
        .await
        .unwrap();

    fx.backend.set_reachable(true);
    fx.engine.force_sync().await;

    let applied = fx.backend.applied();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].payload["qty"], 10);
    assert_eq!(applied[1].payload["qty"], 15);
    assert_eq!(
        fx.backend.entity(EntityType::Material, "M1").unwrap().payload["qty"],
        15
    );
}

#[tokio::test]
async fn ten_failures_make_an_operation_dead() {
    let fx = fixture(true).await;
    let mut events = fx.engine.events();

    let op = fx
        .access
        .create(EntityType::Material, "M1", json!({"name": "Flour"}))
        .await
        .unwrap()
        .operation()
        .clone();

    fx.backend.fail_next_applies(10, "unit of measure unknown");
    for _ in 0..10 {
        fx.engine.force_sync().await;
    }

    let stats = fx.access.stats();
    assert_eq!(stats.pending_operations, 0);
    assert_eq!(stats.dead_operations, 1);

    let dead = fx.engine.queue().get(&op.id).unwrap().unwrap();
    assert!(dead.is_dead());
    assert_eq!(dead.attempts, 10);
    assert!(dead.last_error.unwrap().contains("unit of measure unknown"));

    // A later pass leaves it alone.
    let report = fx.engine.force_sync().await.report().cloned().unwrap();
    assert_eq!(report.applied + report.failed, 0);
    assert_eq!(fx.backend.apply_count(), 0);

    let dead_events: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SyncEvent::OperationDead { .. }))
        .collect();
    assert_eq!(dead_events.len(), 1);

    // Manual requeue delivers it.
    assert!(fx.engine.queue().requeue(&op.id).unwrap());
    fx.engine.force_sync().await;
    assert_eq!(fx.backend.apply_count(), 1);
    assert_eq!(fx.access.stats().dead_operations, 0);
}

#[tokio::test(start_paused = true)]
async fn probe_timeout_takes_engine_offline() {
    let fx = fixture(true).await;
    assert!(fx.access.status().online);
    let mut events = fx.engine.events();
    let handle = Arc::clone(&fx.engine).start();

    fx.backend.set_ping_delay(Some(Duration::from_secs(30)));
    // The ticker's next probe hangs and times out after 5s.
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(!fx.access.status().online);

    fx.access
        .create(EntityType::Material, "M1", json!({"name": "Flour"}))
        .await
        .unwrap();
    assert_eq!(
        fx.engine.reconcile().await,
        PassOutcome::Skipped(SkipReason::Offline)
    );

    // The periodic trigger at 30s does not start a pass either.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(fx.backend.apply_count(), 0);
    assert_eq!(fx.access.status().pending_operations, 1);

    let seen = drain_events(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, SyncEvent::ConnectivityChanged { online: false, .. })));
    assert!(!seen.iter().any(|e| matches!(e, SyncEvent::PassStarted { .. })));

    handle.shutdown().await;
}

// ============================================================================
// Delivery guarantees
// ============================================================================

#[tokio::test]
async fn every_offline_mutation_is_applied_exactly_once() {
    let fx = fixture(false).await;

    for i in 0..7 {
        fx.access
            .create(EntityType::Product, &format!("P{i}"), json!({"name": format!("Loaf {i}")}))
            .await
            .unwrap();
    }
    fx.access
        .update(EntityType::Product, "P3", json!({"name": "Rye loaf", "price": 4.5}))
        .await
        .unwrap();
    fx.access.delete(EntityType::Product, "P6").await.unwrap();

    fx.backend.set_reachable(true);
    fx.engine.force_sync().await;
    fx.engine.force_sync().await;

    let applied = fx.backend.applied();
    assert_eq!(applied.len(), 9);
    let mut ids: Vec<&str> = applied.iter().map(|op| op.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 9);

    assert!(fx.backend.entity(EntityType::Product, "P6").is_none());
    assert_eq!(
        fx.backend.entity(EntityType::Product, "P3").unwrap().payload["name"],
        "Rye loaf"
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_forced_syncs_are_coalesced() {
    let fx = fixture(false).await;
    for key in ["M1", "M2", "M3"] {
        fx.access
            .create(EntityType::Material, key, json!({"name": key}))
            .await
            .unwrap();
    }
    fx.backend.set_reachable(true);
    fx.backend.set_apply_delay(Some(Duration::from_millis(50)));

    let (a, b, c) = tokio::join!(
        fx.engine.force_sync(),
        fx.engine.force_sync(),
        fx.engine.force_sync()
    );
    let completed = [&a, &b, &c].iter().filter(|o| o.report().is_some()).count();
    let coalesced = [&a, &b, &c]
        .iter()
        .filter(|o| o.skip_reason() == Some(SkipReason::AlreadyRunning))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(coalesced, 2);

    fx.engine.force_sync().await;
    assert_eq!(fx.backend.apply_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn timed_out_apply_is_failed_not_acked() {
    let fx = fixture(true).await;
    fx.access
        .create(EntityType::Customer, "C1", json!({"name": "Acme"}))
        .await
        .unwrap();

    fx.backend.set_apply_delay(Some(Duration::from_secs(30)));
    let report = fx.engine.force_sync().await.report().cloned().unwrap();
    assert_eq!(report.applied, 0);
    assert!(matches!(report.errors[0], SyncError::Connectivity(_)));
    assert!(!fx.access.status().online);

    let pending = fx.engine.queue().pending_operations().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);

    fx.backend.set_apply_delay(None);
    fx.engine.force_sync().await;
    assert_eq!(fx.backend.apply_count(), 1);
    assert_eq!(fx.access.status().pending_operations, 0);
}

#[tokio::test]
async fn same_key_order_holds_across_failures() {
    let fx = fixture(false).await;
    fx.access
        .create(EntityType::Batch, "B1", json!({"product_key": "P1", "quantity": 40}))
        .await
        .unwrap();
    fx.access
        .update(EntityType::Batch, "B1", json!({"product_key": "P1", "quantity": 38}))
        .await
        .unwrap();
    fx.access.delete(EntityType::Batch, "B1").await.unwrap();

    fx.backend.set_reachable(true);
    fx.backend.fail_next_applies(2, "try again");
    fx.engine.force_sync().await;
    fx.engine.force_sync().await;
    fx.engine.force_sync().await;

    let kinds: Vec<OperationKind> = fx.backend.applied().iter().map(|op| op.kind).collect();
    assert_eq!(
        kinds,
        vec![OperationKind::Create, OperationKind::Update, OperationKind::Delete]
    );
    assert!(fx.backend.entity(EntityType::Batch, "B1").is_none());
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_in_flight_operation_finish() {
    let fx = fixture(true).await;
    for key in ["S1", "S2", "S3"] {
        fx.access
            .create(EntityType::Sale, key, json!({"customer_key": "C1", "qty": 1}))
            .await
            .unwrap();
    }
    fx.backend.set_apply_delay(Some(Duration::from_secs(1)));

    let handle = Arc::clone(&fx.engine).start();
    let engine = Arc::clone(&fx.engine);
    let pass = tokio::spawn(async move { engine.force_sync().await });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    handle.shutdown().await;
    let report = pass.await.unwrap().report().cloned().unwrap();

    assert!(report.interrupted);
    assert_eq!(report.applied, 2);
    assert_eq!(fx.backend.apply_count(), 2);
    assert_eq!(fx.access.status().pending_operations, 1);
}

// ============================================================================
// Merge policy
// ============================================================================

#[tokio::test]
async fn pending_local_write_wins_until_acknowledged() {
    let fx = fixture(true).await;
    fx.backend
        .seed(Entity::new(EntityType::Material, "M1", json!({"name": "Flour", "qty": 1})));
    fx.engine.force_sync().await;

    fx.backend.set_reachable(false);
    fx.access
        .update(EntityType::Material, "M1", json!({"name": "Flour", "qty": 10}))
        .await
        .unwrap();
    // Someone else edits the same record on the backend meanwhile.
    fx.backend
        .seed(Entity::new(EntityType::Material, "M1", json!({"name": "Flour", "qty": 99})));
    fx.backend
        .seed(Entity::new(EntityType::Material, "M2", json!({"name": "Salt"})));

    fx.backend.fail_next_applies(1, "conflict");
    fx.backend.set_reachable(true);
    let report = fx.engine.force_sync().await.report().cloned().unwrap();
    assert_eq!(report.merged.kept_local, 1);

    let local = fx.access.get(EntityType::Material, "M1").await.unwrap().unwrap();
    assert_eq!(local.payload["qty"], 10);
    assert!(fx.access.get(EntityType::Material, "M2").await.unwrap().is_some());

    // Once delivered, the backend is authoritative again.
    fx.engine.force_sync().await;
    fx.backend
        .seed(Entity::new(EntityType::Material, "M1", json!({"name": "Flour", "qty": 12})));
    fx.engine.force_sync().await;
    let local = fx.access.get(EntityType::Material, "M1").await.unwrap().unwrap();
    assert_eq!(local.payload["qty"], 12);
}

#[tokio::test]
async fn remote_deletion_is_mirrored_locally() {
    let fx = fixture(true).await;
    fx.backend
        .seed(Entity::new(EntityType::Customer, "C1", json!({"name": "Acme"})));
    fx.engine.force_sync().await;
    assert_eq!(fx.access.list(EntityType::Customer).await.unwrap().len(), 1);

    fx.backend.unseed(EntityType::Customer, "C1");
    let report = fx.engine.force_sync().await.report().cloned().unwrap();
    assert_eq!(report.merged.removed, 1);
    assert!(fx
        .engine
        .store()
        .read_one(EntityType::Customer, "C1")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn dead_operation_keeps_protecting_its_key() {
    let fx = fixture(true).await;
    fx.access
        .create(EntityType::Product, "P1", json!({"name": "Local bread"}))
        .await
        .unwrap();
    fx.backend.fail_next_applies(10, "rejected");
    for _ in 0..10 {
        fx.engine.force_sync().await;
    }
    assert_eq!(fx.access.stats().dead_operations, 1);

    fx.backend
        .seed(Entity::new(EntityType::Product, "P1", json!({"name": "Remote bread"})));
    fx.engine.force_sync().await;
    let local = fx.access.get(EntityType::Product, "P1").await.unwrap().unwrap();
    assert_eq!(local.payload["name"], "Local bread");
}

#[tokio::test]
async fn requeued_dead_operation_is_delivered_before_newer_write() {
    let fx = fixture(true).await;
    let older = fx
        .access
        .update(EntityType::Material, "M1", json!({"name": "Flour", "qty": 10}))
        .await
        .unwrap();
    fx.backend.fail_next_applies(10, "rejected");
    for _ in 0..10 {
        fx.engine.force_sync().await;
    }
    assert_eq!(fx.access.stats().dead_operations, 1);

    fx.access
        .update(EntityType::Material, "M1", json!({"name": "Flour", "qty": 15}))
        .await
        .unwrap();
    fx.engine.force_sync().await;
    assert_eq!(fx.backend.apply_count(), 0, "newer write must wait behind the dead one");
    assert_eq!(fx.access.status().pending_operations, 1);

    assert!(fx.engine.queue().requeue(&older.operation().id).unwrap());
    fx.engine.force_sync().await;

    let order: Vec<_> = fx
        .backend
        .applied()
        .iter()
        .map(|op| op.payload["qty"].as_i64())
        .collect();
    assert_eq!(order, vec![Some(10), Some(15)]);
    let remote = fx.backend.entity(EntityType::Material, "M1").unwrap();
    assert_eq!(remote.payload["qty"], 15);
    let local = fx.access.get(EntityType::Material, "M1").await.unwrap().unwrap();
    assert_eq!(local.payload["qty"], 15);
    assert_eq!(fx.access.status().pending_operations, 0);
}

#[tokio::test]
async fn dead_operation_does_not_hold_back_other_keys() {
    let fx = fixture(true).await;
    fx.access
        .update(EntityType::Material, "M1", json!({"name": "Flour", "qty": 10}))
        .await
        .unwrap();
    fx.backend.fail_next_applies(10, "rejected");
    for _ in 0..10 {
        fx.engine.force_sync().await;
    }

    fx.access
        .update(EntityType::Material, "M2", json!({"name": "Sugar", "qty": 1}))
        .await
        .unwrap();
    fx.engine.force_sync().await;
    assert!(fx.backend.entity(EntityType::Material, "M2").is_some());
    assert!(fx.backend.entity(EntityType::Material, "M1").is_none());
}

// ============================================================================
// Durability and degradation
// ============================================================================

#[tokio::test]
async fn queue_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("stocksync.db");

    {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_reachable(false);
        let fx = fixture_with(LocalStore::open(&db_path).unwrap(), backend, fast_retry_config());
        fx.engine.initialize().await;
        fx.access
            .create(EntityType::Material, "M1", json!({"name": "Flour"}))
            .await
            .unwrap();
        fx.access
            .update(EntityType::Material, "M1", json!({"name": "Flour", "qty": 3}))
            .await
            .unwrap();
    }

    let backend = Arc::new(MemoryBackend::new());
    let fx = fixture_with(
        LocalStore::open(&db_path).unwrap(),
        Arc::clone(&backend),
        fast_retry_config(),
    );
    assert_eq!(fx.engine.queue().size().unwrap(), 2);

    let report = fx.engine.initialize().await;
    assert_eq!(report.initial_pass.unwrap().applied, 2);
    assert_eq!(backend.entity(EntityType::Material, "M1").unwrap().payload["qty"], 3);
    assert!(fx.access.stats().last_sync.is_some());
}

#[tokio::test]
async fn unavailable_store_at_startup_writes_to_remote() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the database directory should be.
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    let store = LocalStore::open_or_unavailable(blocker.join("stocksync.db"));
    assert!(!store.is_available());

    let backend = Arc::new(MemoryBackend::new());
    let fx = fixture_with(store, Arc::clone(&backend), fast_retry_config());
    let report = fx.engine.initialize().await;
    assert_eq!(report.mode, OperatingMode::RemoteOnly);
    assert!(fx.access.stats().initialized);

    fx.access
        .create(EntityType::Material, "M1", json!({"name": "Flour"}))
        .await
        .unwrap();
    assert!(backend.entity(EntityType::Material, "M1").is_some());
    assert_eq!(
        fx.access.get(EntityType::Material, "M1").await.unwrap().unwrap().payload["name"],
        "Flour"
    );
}

#[tokio::test]
async fn reset_store_resumes_local_mode() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let fx = fixture_with(
        LocalStore::open(dir.path().join("stocksync.db")).unwrap(),
        Arc::clone(&backend),
        fast_retry_config(),
    );
    fx.engine.initialize().await;
    let mut events = fx.engine.events();

    fx.engine
        .store()
        .mark_unavailable(&stocksync_core::DatabaseError::QueryFailed("disk I/O error".into()));
    fx.access
        .create(EntityType::Material, "M1", json!({"name": "Flour"}))
        .await
        .unwrap();
    assert_eq!(fx.access.status().mode, OperatingMode::RemoteOnly);

    fx.engine.reset_store().unwrap();
    assert_eq!(fx.access.status().mode, OperatingMode::Local);
    let outcome = fx
        .access
        .update(EntityType::Material, "M1", json!({"name": "Flour", "qty": 2}))
        .await
        .unwrap();
    assert!(outcome.is_queued());

    let seen = drain_events(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, SyncEvent::LocalStoreRestored { .. })));
}

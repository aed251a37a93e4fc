//! Cross-component integration tests
//!
//! Exercises the queue, checkpoint store, and transaction coordinator
//! together the way a host engine would: interrupt-aware task processing,
//! checkpoint round trips through eviction and crash recovery, and
//! transaction scopes with compensating rollback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use runcore::{
    CheckpointStore, CheckpointStoreConfig, CompensationRegistry, FsStorage, InMemoryStorage,
    PersistencePolicy, PriorityTaskQueue, QueueConfig, TaskPriority, TransactionCoordinator,
    TransactionError, TransactionState,
};

fn memory_store(config: CheckpointStoreConfig) -> (CheckpointStore, Arc<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let store = CheckpointStore::new(storage.clone(), config).unwrap();
    (store, storage)
}

async fn wait_for_drain(store: &CheckpointStore) {
    for _ in 0..200 {
        if store.pending_persist_count() == 0 && !store.is_draining() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("persistence drain did not complete");
}

// ============================================
// Queue + interrupt flow
// ============================================

#[test_log::test(tokio::test)]
async fn test_interrupt_preempts_backlog() {
    let queue = PriorityTaskQueue::new(QueueConfig::default());

    for i in 0..5 {
        queue
            .enqueue("step", json!({"n": i}), TaskPriority::Normal, "run-1")
            .unwrap();
    }
    assert!(queue.check_for_interrupt("run-1").is_none());

    // A long-running worker polls between steps; an interrupt arrives
    queue
        .enqueue("stop", json!({}), TaskPriority::Interrupt, "run-1")
        .unwrap();

    let interrupt = queue.check_for_interrupt("run-1").expect("interrupt at head");
    assert_eq!(interrupt.kind, "stop");

    // Dequeue drains the interrupt first, then the backlog in FIFO order
    let first = queue.dequeue("run-1").unwrap();
    assert_eq!(first.priority, TaskPriority::Interrupt);
    let next = queue.dequeue("run-1").unwrap();
    assert_eq!(next.payload, json!({"n": 0}));
}

#[test_log::test(tokio::test)]
async fn test_contexts_are_isolated() {
    let queue = PriorityTaskQueue::new(QueueConfig::default());

    queue
        .enqueue("a", json!({}), TaskPriority::Interrupt, "run-1")
        .unwrap();
    queue
        .enqueue("b", json!({}), TaskPriority::Low, "run-2")
        .unwrap();

    assert!(queue.check_for_interrupt("run-2").is_none());
    assert_eq!(queue.pending_count("run-1"), 1);
    assert_eq!(queue.pending_count("run-2"), 1);
}

// ============================================
// Checkpoint round trips
// ============================================

#[test_log::test(tokio::test)]
async fn test_round_trip_survives_cache_eviction() {
    let (store, _) = memory_store(CheckpointStoreConfig::new().with_cache_max_size(2));

    for i in 0..10 {
        store
            .create_checkpoint("run-1", format!("cp{i}"), json!({"n": i}), json!({}))
            .await
            .unwrap();
    }
    store.flush().await.unwrap();

    // Early checkpoints were evicted from the cache long ago; reads fall
    // back to storage transparently
    let restored = store.restore_from_checkpoint("run-1", "cp0").await.unwrap();
    assert_eq!(restored, json!({"n": 0}));

    let latest = store.get_latest_checkpoint("run-1").await.unwrap().unwrap();
    assert_eq!(latest.id, "cp9");
}

#[test_log::test(tokio::test)]
async fn test_latest_pointer_ignores_deletes() {
    let (store, _) = memory_store(CheckpointStoreConfig::default());

    store
        .create_checkpoint("run-1", "cp1", json!({"n": 1}), json!({}))
        .await
        .unwrap();
    store
        .create_checkpoint("run-1", "cp2", json!({"n": 2}), json!({}))
        .await
        .unwrap();
    store.flush().await.unwrap();

    assert!(store.delete_checkpoint("run-1", "cp1").await.unwrap());

    let latest = store.get_latest_checkpoint("run-1").await.unwrap().unwrap();
    assert_eq!(latest.id, "cp2");
}

#[test_log::test(tokio::test)]
async fn test_fs_backend_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(
        Arc::new(FsStorage::new(dir.path().join("checkpoints"))),
        CheckpointStoreConfig::new().with_wal_path(dir.path().join("wal.jsonl")),
    )
    .unwrap();

    store
        .create_checkpoint("run-1", "cp1", json!({"step": "greeted"}), json!({}))
        .await
        .unwrap();
    wait_for_drain(&store).await;

    let restored = store.restore_from_checkpoint("run-1", "cp1").await.unwrap();
    assert_eq!(restored, json!({"step": "greeted"}));
    assert_eq!(store.list_checkpoints("run-1").await.unwrap(), vec!["cp1"]);
}

// ============================================
// Crash recovery
// ============================================

#[test_log::test(tokio::test)]
async fn test_wal_replay_recovers_unpersisted_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("wal.jsonl");

    // Crash before the batch window ever flushes
    {
        let store = CheckpointStore::new(
            Arc::new(InMemoryStorage::new()),
            CheckpointStoreConfig::new()
                .with_wal_path(&wal_path)
                .with_policy(PersistencePolicy::Batched {
                    max_items: 1000,
                    max_delay: Duration::from_secs(600),
                }),
        )
        .unwrap();

        for i in 0..3 {
            store
                .create_checkpoint("run-1", format!("cp{i}"), json!({"n": i}), json!({}))
                .await
                .unwrap();
        }
    }

    // Restart: replay the WAL into a fresh store
    let storage = Arc::new(InMemoryStorage::new());
    let store = CheckpointStore::new(
        storage.clone(),
        CheckpointStoreConfig::new().with_wal_path(&wal_path),
    )
    .unwrap();

    assert_eq!(store.recover().await.unwrap(), 3);
    assert_eq!(
        store.restore_from_checkpoint("run-1", "cp1").await.unwrap(),
        json!({"n": 1})
    );
    let latest = store.get_latest_checkpoint("run-1").await.unwrap().unwrap();
    assert_eq!(latest.id, "cp2");

    // Recovered records drain to durable storage, then the log is truncated
    wait_for_drain(&store).await;
    assert_eq!(storage.len(), 3);

    let fresh = CheckpointStore::new(
        Arc::new(InMemoryStorage::new()),
        CheckpointStoreConfig::new().with_wal_path(&wal_path),
    )
    .unwrap();
    assert_eq!(fresh.recover().await.unwrap(), 0);
}

// ============================================
// Transactions
// ============================================

#[test_log::test(tokio::test)]
async fn test_booking_rollback_compensates_in_reverse() {
    let registry = Arc::new(CompensationRegistry::new());
    let undo_order = Arc::new(Mutex::new(vec![]));

    for name in ["compensate_book_slot", "compensate_charge_card"] {
        let undo_order = undo_order.clone();
        registry.register(name, move |_args, _result| {
            let undo_order = undo_order.clone();
            let name = name.to_string();
            async move {
                undo_order.lock().unwrap().push(name);
                Ok(())
            }
        });
    }

    let (store, _) = memory_store(CheckpointStoreConfig::default());
    let coordinator = TransactionCoordinator::new(Arc::new(store), registry);

    let txn = coordinator.begin("run-1", None, None).await.unwrap();
    txn.record_operation("book_slot", json!({"slot": "10am"}), json!({"id": 7}), None)
        .unwrap();
    txn.record_operation("charge_card", json!({"amount": 50}), json!({"ref": "x"}), None)
        .unwrap();
    txn.rollback().await.unwrap();

    assert_eq!(txn.state().unwrap(), TransactionState::RolledBack);
    assert_eq!(
        *undo_order.lock().unwrap(),
        vec!["compensate_charge_card", "compensate_book_slot"]
    );
}

#[test_log::test(tokio::test)]
async fn test_idempotent_retry_after_commit() {
    let (store, _) = memory_store(CheckpointStoreConfig::default());
    let coordinator =
        TransactionCoordinator::new(Arc::new(store), Arc::new(CompensationRegistry::new()));

    let txn = coordinator
        .begin("run-1", None, Some("booking-42"))
        .await
        .unwrap();
    txn.record_operation("book_slot", json!({}), json!({}), None)
        .unwrap();
    txn.commit().await.unwrap();

    // A client retry with the same key must not open a second transaction
    let retry = coordinator
        .begin("run-1", None, Some("booking-42"))
        .await
        .unwrap();
    assert_eq!(retry.id(), txn.id());
    assert_eq!(retry.state().unwrap(), TransactionState::Committed);
}

#[test_log::test(tokio::test)]
async fn test_scoped_transaction_with_checkpoints() {
    let (store, _) = memory_store(CheckpointStoreConfig::default());
    let store = Arc::new(store);

    let registry = Arc::new(CompensationRegistry::new());
    let refunds = Arc::new(AtomicU32::new(0));
    let counter = refunds.clone();
    registry.register("compensate_charge_card", move |_args, _result| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let coordinator =
        TransactionCoordinator::new(store.clone(), registry).with_auto_checkpoint(true);

    // Success path: commits and leaves pre/post checkpoints behind
    let booked: Result<&str, TransactionError> = coordinator
        .with_transaction("run-1", |txn| async move {
            txn.record_operation("charge_card", json!({"amount": 50}), json!({}), None)?;
            Ok("confirmed")
        })
        .await;
    assert_eq!(booked.unwrap(), "confirmed");
    assert_eq!(store.list_checkpoints("run-1").await.unwrap().len(), 2);
    assert_eq!(refunds.load(Ordering::SeqCst), 0);

    // Failure path: rolls back and refunds
    let failed: Result<&str, TransactionError> = coordinator
        .with_transaction("run-1", |txn| async move {
            txn.record_operation("charge_card", json!({"amount": 50}), json!({}), None)?;
            Err(TransactionError::NotFound(uuid::Uuid::now_v7()))
        })
        .await;
    assert!(failed.is_err());
    assert_eq!(refunds.load(Ordering::SeqCst), 1);
}

// ============================================
// Engine-shaped end-to-end flow
// ============================================

#[test_log::test(tokio::test)]
async fn test_process_tasks_with_checkpoint_per_step() {
    let queue = PriorityTaskQueue::new(QueueConfig::default());
    let (store, _) = memory_store(CheckpointStoreConfig::default());

    for step in ["parse", "plan", "act"] {
        queue
            .enqueue(step, json!({"step": step}), TaskPriority::Normal, "run-1")
            .unwrap();
    }

    let mut completed = vec![];
    while let Some(task) = queue.dequeue("run-1") {
        store
            .create_checkpoint(
                "run-1",
                format!("after-{}", task.kind),
                json!({"completed": task.kind}),
                json!({"task_id": task.id}),
            )
            .await
            .unwrap();
        completed.push(task.kind);
    }

    assert_eq!(completed, vec!["parse", "plan", "act"]);
    let latest = store.get_latest_checkpoint("run-1").await.unwrap().unwrap();
    assert_eq!(latest.state, json!({"completed": "act"}));
    wait_for_drain(&store).await;
}

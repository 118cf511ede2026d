#![cfg(feature = "store-sqlite")]

use std::sync::Arc;
use std::time::Duration;

use ditto_relay::clock::SystemClock;
use ditto_relay::ledger::{LedgerConfig, QuotaLedger, ReserveRequest};
use ditto_relay::observability::Observability;
use ditto_relay::store::{LedgerStore, LogKind, SqliteStore, TaskStore, UserRecord};
use ditto_relay::task::{NewTask, ProviderTaskUpdate, TaskService, TaskStatus, TaskTransition};
use serde_json::json;

async fn open(path: &std::path::Path) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::new(path));
    store.init().await.expect("init");
    store
}

fn ledger(store: Arc<SqliteStore>) -> QuotaLedger {
    QuotaLedger::new(
        store,
        &LedgerConfig {
            balance_cache_ttl_secs: 0,
        },
        Arc::new(SystemClock),
        Arc::new(Observability::new()),
    )
}

fn reserve_request(estimated_quota: i64) -> ReserveRequest {
    ReserveRequest {
        user_id: 1,
        channel_id: 7,
        token_id: Some(3),
        token_name: Some("primary".to_string()),
        model: "suno_music".to_string(),
        estimated_quota,
        description: "suno MUSIC".to_string(),
        other: json!({"action": "MUSIC"}),
    }
}

#[tokio::test]
async fn settled_usage_survives_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("relay.sqlite");

    {
        let store = open(&db_path).await;
        assert!(store.seed_user(UserRecord::new(1, "default", 1000)).await.unwrap());
        let ledger = ledger(store.clone());

        let reservation = ledger.reserve(reserve_request(150)).await.expect("reserve");
        assert_eq!(store.user(1).await.unwrap().quota, 850);
        let settlement = ledger.settle(reservation, 120, true).await.expect("settle");
        assert_eq!(settlement.charged, 120);
        assert_eq!(settlement.refunded, 30);
    }

    let store = open(&db_path).await;
    // Seeding again must not reset a balance that already moved.
    assert!(!store.seed_user(UserRecord::new(1, "default", 1000)).await.unwrap());
    let user = store.user(1).await.unwrap();
    assert_eq!(user.quota, 880);
    assert_eq!(user.used_quota, 120);
    assert_eq!(store.channel_used_quota(7).await.unwrap(), 120);
    assert_eq!(store.pending_reservations().await.unwrap(), 0);

    let logs = store.list_logs(Some(1), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].entry.kind, LogKind::Consume);
    assert_eq!(logs[0].entry.quota, 120);
    assert_eq!(logs[0].entry.model.as_deref(), Some("suno_music"));
    assert_eq!(logs[0].entry.other["action"], "MUSIC");
}

#[tokio::test]
async fn insufficient_balance_is_rejected_without_debit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir.path().join("relay.sqlite")).await;
    store.seed_user(UserRecord::new(1, "default", 100)).await.unwrap();
    let ledger = ledger(store.clone());

    let err = ledger.reserve(reserve_request(101)).await.unwrap_err();
    assert_eq!(err.code(), "quota_not_enough");
    assert_eq!(store.user(1).await.unwrap().quota, 100);
    assert_eq!(store.pending_reservations().await.unwrap(), 0);
}

#[tokio::test]
async fn dropped_reservation_is_rolled_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir.path().join("relay.sqlite")).await;
    store.seed_user(UserRecord::new(1, "default", 500)).await.unwrap();
    let ledger = ledger(store.clone());

    let reservation = ledger.reserve(reserve_request(200)).await.expect("reserve");
    assert_eq!(store.user(1).await.unwrap().quota, 300);
    drop(reservation);

    for _ in 0..100 {
        if store.pending_reservations().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.pending_reservations().await.unwrap(), 0);
    assert_eq!(store.user(1).await.unwrap().quota, 500);
}

#[tokio::test]
async fn failed_task_refund_is_persisted_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("relay.sqlite");
    let store = open(&db_path).await;
    store.seed_user(UserRecord::new(1, "default", 900)).await.unwrap();
    let observability = Arc::new(Observability::new());
    let tasks = TaskService::new(store.clone(), Arc::new(ledger(store.clone())), observability.clone());

    let task = tasks
        .create_task(NewTask {
            platform: "suno".to_string(),
            action: "MUSIC".to_string(),
            user_id: 1,
            channel_id: 7,
            token_id: Some(3),
            provider_task_id: "up-1".to_string(),
            quota: 100,
            data: json!({}),
        })
        .await
        .expect("task");

    let failure = ProviderTaskUpdate {
        provider_task_id: "up-1".to_string(),
        status: TaskStatus::Failed,
        progress: None,
        fail_reason: Some("content policy".to_string()),
        data: serde_json::Value::Null,
    };
    let first = tasks
        .update_from_provider_poll(&task, failure.clone())
        .await
        .expect("first update");
    assert_eq!(
        first,
        TaskTransition::Applied {
            from: TaskStatus::Pending,
            to: TaskStatus::Failed,
        }
    );
    // A redelivery against the stale snapshot must not refund again.
    let second = tasks
        .update_from_provider_poll(&task, failure)
        .await
        .expect("second update");
    assert_eq!(
        second,
        TaskTransition::Ignored {
            current: TaskStatus::Failed,
        }
    );
    assert_eq!(observability.snapshot().refunds, 1);

    let reopened = open(&db_path).await;
    assert_eq!(reopened.user(1).await.unwrap().quota, 1000);
    let stored = reopened
        .find_task(Some(1), "up-1")
        .await
        .unwrap()
        .expect("task by provider id");
    assert_eq!(stored.id, task.id);
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.fail_reason.as_deref(), Some("content policy"));
    assert!(stored.finish_time_ms.is_some());
    assert!(reopened.unfinished_tasks(None, 10).await.unwrap().is_empty());

    let refunds: Vec<_> = reopened
        .list_logs(Some(1), 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|log| log.entry.kind == LogKind::Refund)
        .collect();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].entry.quota, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_reservations_all_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir.path().join("relay.sqlite")).await;
    store.seed_user(UserRecord::new(1, "default", 100_000)).await.unwrap();
    let ledger = Arc::new(ledger(store.clone()));

    let attempts = (0..64).map(|_| {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.reserve(reserve_request(10)).await })
    });
    let mut held = Vec::new();
    for attempt in futures_util::future::join_all(attempts).await {
        held.push(attempt.unwrap().expect("reserve under contention"));
    }
    assert_eq!(store.user(1).await.unwrap().quota, 100_000 - 640);
    assert_eq!(store.pending_reservations().await.unwrap(), 64);

    for reservation in held {
        ledger.settle(reservation, 10, true).await.expect("settle");
    }
    assert_eq!(store.pending_reservations().await.unwrap(), 0);
    assert_eq!(store.user(1).await.unwrap().used_quota, 640);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_reservations_fail_on_quota_not_on_locking() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir.path().join("relay.sqlite")).await;
    store.seed_user(UserRecord::new(1, "default", 1000)).await.unwrap();
    let ledger = Arc::new(ledger(store.clone()));

    let attempts = (0..2).map(|_| {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.reserve(reserve_request(600)).await })
    });
    let mut granted = Vec::new();
    let mut rejected = Vec::new();
    for attempt in futures_util::future::join_all(attempts).await {
        match attempt.unwrap() {
            Ok(reservation) => granted.push(reservation),
            Err(err) => rejected.push(err.code().to_string()),
        }
    }
    assert_eq!(granted.len(), 1);
    assert_eq!(rejected, vec!["quota_not_enough".to_string()]);
    assert_eq!(store.user(1).await.unwrap().quota, 400);
}

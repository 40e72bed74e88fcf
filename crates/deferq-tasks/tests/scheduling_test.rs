//! End-to-end runs of the sample tasks through the engine
//!
//! The whole pipeline over the in-memory store: schedule via TaskManager,
//! claim via the category poller, execute the sample task, observe the
//! outcome in the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use deferq::{
    InMemoryTaskStore, PollerConfig, RetryPolicy, TaskManager, TaskParams, TaskRecord,
    TaskRegistry, TaskStatus, TaskStore, WorkerConfig, WorkerManager,
};
use deferq_tasks::{register_builtin, AlwaysFailingTask, LongRunningTask, SendEmailTask};

struct Engine {
    store: Arc<InMemoryTaskStore>,
    manager: TaskManager,
    workers: WorkerManager,
}

fn engine() -> Engine {
    let store = Arc::new(InMemoryTaskStore::new());
    let mut registry = TaskRegistry::new();
    register_builtin(&mut registry);

    Engine {
        store: store.clone(),
        manager: TaskManager::new(store.clone() as Arc<dyn TaskStore>),
        workers: WorkerManager::new(store as Arc<dyn TaskStore>, Arc::new(registry)),
    }
}

fn fast_config(category: &str) -> WorkerConfig {
    WorkerConfig::new(category)
        .with_poller(PollerConfig::new().with_interval(Duration::from_millis(10)))
        .with_shutdown_timeout(Duration::from_secs(2))
}

async fn wait_for_terminal(engine: &Engine, category: &str, id: Uuid) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = engine.store.get(category, id).await.unwrap();
        if record.status.is_terminal() {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task never reached a terminal status: {record:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_log::test(tokio::test)]
async fn send_email_completes() {
    let engine = engine();
    engine
        .workers
        .init(fast_config("email"), RetryPolicy::no_retry())
        .await
        .unwrap();

    let params =
        TaskParams::parse(r#"{"to": "ops@example.com", "subject": "deploy done"}"#).unwrap();
    let id = engine
        .manager
        .schedule_as::<SendEmailTask>("email", params, Utc::now())
        .await
        .unwrap();

    let record = wait_for_terminal(&engine, "email", id).await;
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.attempt_count, 1);

    engine.workers.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn send_email_with_bad_payload_retries_then_fails() {
    let engine = engine();
    engine
        .workers
        .init(fast_config("email"), RetryPolicy::no_retry())
        .await
        .unwrap();

    // Missing "subject": every attempt fails on deserialization
    let params = TaskParams::parse(r#"{"to": "ops@example.com"}"#)
        .unwrap()
        .with_retry_policy(RetryPolicy::fixed(Duration::ZERO, 2));
    let id = engine
        .manager
        .schedule_as::<SendEmailTask>("email", params, Utc::now())
        .await
        .unwrap();

    let record = wait_for_terminal(&engine, "email", id).await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.attempt_count, 2);

    engine.workers.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn always_fail_exhausts_its_policy() {
    let engine = engine();
    engine
        .workers
        .init(fast_config("chores"), RetryPolicy::no_retry())
        .await
        .unwrap();

    let params = TaskParams::parse("{}")
        .unwrap()
        .with_retry_policy(RetryPolicy::fixed(Duration::ZERO, 3));
    let id = engine
        .manager
        .schedule_as::<AlwaysFailingTask>("chores", params, Utc::now())
        .await
        .unwrap();

    let record = wait_for_terminal(&engine, "chores", id).await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.attempt_count, 3);

    engine.workers.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn long_running_tasks_share_the_pool() {
    let engine = engine();
    engine
        .workers
        .init(
            fast_config("batch").with_max_concurrency(2),
            RetryPolicy::no_retry(),
        )
        .await
        .unwrap();

    let mut ids = vec![];
    for _ in 0..4 {
        let params = TaskParams::parse(r#"{"duration_ms": 30}"#).unwrap();
        ids.push(
            engine
                .manager
                .schedule_as::<LongRunningTask>("batch", params, Utc::now())
                .await
                .unwrap(),
        );
    }

    for id in ids {
        let record = wait_for_terminal(&engine, "batch", id).await;
        assert_eq!(record.status, TaskStatus::Completed);
    }

    engine.workers.shutdown().await;
}

//! Integration tests for reconnection: backoff schedule, exhaustion and
//! cancellation by close.

mod common;

use common::{Probe, connect, fixed_policy, scripted_manager};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use unidb::db::ManagerOptions;
use unidb::{BackendType, ConnectionState, DbError};

fn options(max_attempts: u32) -> ManagerOptions {
    ManagerOptions::default()
        .with_max_connections(4)
        .with_policy(fixed_policy(max_attempts))
}

/// Drive `id` into `Reconnecting` through a failed probe.
async fn fail_probe(manager: &unidb::ConnectionManager, id: &str) {
    let results = manager.health_check_all().await;
    assert!(!results[id].connected);
    assert_eq!(results[id].state, ConnectionState::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_three_failures() {
    let (manager, factory) = scripted_manager(options(5));
    connect(&manager, "db1", BackendType::Postgres).await;
    let script = factory.script("db1");
    script.set_probe(Probe::Fail);
    fail_probe(&manager, "db1").await;

    script.fail_connects(3);
    let start = Instant::now();
    manager.reconnect("db1").await.unwrap();

    // 1s + 2s + 4s + 8s of backoff before the fourth attempt succeeds
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(15), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(16), "waited {:?}", waited);
    assert_eq!(manager.state("db1").unwrap(), ConnectionState::Connected);
    // Initial connect plus four attempts
    assert_eq!(script.connects.load(Ordering::SeqCst), 5);

    let summary = &manager.list_connections()[0];
    assert!(summary.last_error.is_none());

    script.set_probe(Probe::Healthy);
    manager.execute_query("db1", "SELECT 1", &[]).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_moves_to_error_with_last_error() {
    let (manager, factory) = scripted_manager(options(3));
    connect(&manager, "db1", BackendType::Redis).await;
    let script = factory.script("db1");
    script.set_probe(Probe::Down);
    fail_probe(&manager, "db1").await;

    script.fail_connects(10);
    let err = manager.reconnect("db1").await.unwrap_err();

    assert_eq!(err.code(), "CONNECTION_FAILED");
    // Connect #1 was the initial one; attempts are #2, #3 and #4
    assert!(err.to_string().contains("connect #4"), "got {}", err);
    assert_eq!(manager.state("db1").unwrap(), ConnectionState::Error);
    assert_eq!(script.connects.load(Ordering::SeqCst), 4);

    let summary = &manager.list_connections()[0];
    assert_eq!(summary.last_error.as_deref(), Some(err.to_string().as_str()));

    // Error entries are not probed
    assert!(manager.health_check_all().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restart_from_error() {
    let (manager, factory) = scripted_manager(options(2));
    connect(&manager, "db1", BackendType::MongoDB).await;
    let script = factory.script("db1");
    script.set_probe(Probe::Fail);
    fail_probe(&manager, "db1").await;

    script.fail_connects(5);
    assert!(manager.reconnect("db1").await.is_err());
    assert_eq!(manager.state("db1").unwrap(), ConnectionState::Error);

    script.fail_connects(0);
    manager.reconnect("db1").await.unwrap();
    assert_eq!(manager.state("db1").unwrap(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_on_connected_entry_is_noop() {
    let (manager, factory) = scripted_manager(options(3));
    connect(&manager, "db1", BackendType::Neo4j).await;

    let start = Instant::now();
    manager.reconnect("db1").await.unwrap();
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(factory.script("db1").connects.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state("db1").unwrap(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_close_aborts_reconnect() {
    let (manager, factory) = scripted_manager(
        ManagerOptions::default().with_policy(unidb::ReconnectPolicy {
            base_delay: Duration::from_secs(10),
            ..fixed_policy(5)
        }),
    );
    connect(&manager, "db1", BackendType::Cassandra).await;
    let script = factory.script("db1");
    script.set_probe(Probe::Hang);
    fail_probe(&manager, "db1").await;

    let reconnecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.reconnect("db1").await })
    };
    // Let the loop start its first backoff sleep
    tokio::time::sleep(Duration::from_secs(1)).await;

    manager.close_connection("db1").await.unwrap();
    let err = reconnecting.await.unwrap().unwrap_err();
    assert!(matches!(err, DbError::NotFound { .. }));

    // The aborted loop never reached the adapter's connect
    assert_eq!(script.connects.load(Ordering::SeqCst), 1);
    assert!(!manager.contains("db1"));
}

#[tokio::test(start_paused = true)]
async fn test_close_aborts_hanging_connect() {
    let (manager, factory) = scripted_manager(options(5));
    connect(&manager, "db1", BackendType::DynamoDB).await;
    let script = factory.script("db1");
    script.set_probe(Probe::Down);
    fail_probe(&manager, "db1").await;

    script.set_connect_delay(Duration::from_secs(3600));
    let reconnecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.reconnect("db1").await })
    };
    // Past the 1s backoff, into the hanging connect
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(script.connects.load(Ordering::SeqCst), 2);

    manager.close_connection("db1").await.unwrap();
    let err = reconnecting.await.unwrap().unwrap_err();
    assert!(matches!(err, DbError::NotFound { .. }));
}

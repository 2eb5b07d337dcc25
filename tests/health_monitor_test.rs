//! Integration tests for health sweeps, recovery and the periodic monitor.

mod common;

use common::{Probe, connect, fixed_policy, scripted_manager};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use unidb::db::{HealthMonitor, ManagerOptions};
use unidb::{BackendType, ConnectionState};

fn options() -> ManagerOptions {
    ManagerOptions::default()
        .with_max_connections(8)
        .with_health_timeout(Duration::from_secs(2))
        .with_policy(fixed_policy(2))
}

#[tokio::test(start_paused = true)]
async fn test_probe_timeout_marks_only_that_entry() {
    let (manager, factory) = scripted_manager(options());
    for id in ["a", "b", "c"] {
        connect(&manager, id, BackendType::Postgres).await;
    }
    factory.script("b").set_probe(Probe::Hang);

    let results = manager.health_check_all().await;
    assert_eq!(results.len(), 3);

    let b = &results["b"];
    assert!(!b.connected);
    assert!(!b.skipped);
    assert_eq!(b.state, ConnectionState::Reconnecting);
    assert!(b.error.as_deref().unwrap_or_default().starts_with("Timeout"));

    for id in ["a", "c"] {
        assert!(results[id].connected);
        assert_eq!(results[id].state, ConnectionState::Connected);
        assert_eq!(manager.state(id).unwrap(), ConnectionState::Connected);
    }
    assert_eq!(manager.state("b").unwrap(), ConnectionState::Reconnecting);

    let summaries = manager.list_connections();
    assert!(summaries.iter().all(|s| s.last_health_check_at.is_some()));
    assert!(summaries[1].last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_passing_probe_restores_reconnecting_entry() {
    let (manager, factory) = scripted_manager(options());
    connect(&manager, "db1", BackendType::Redis).await;
    let script = factory.script("db1");

    script.set_probe(Probe::Fail);
    manager.health_check_all().await;
    assert_eq!(manager.state("db1").unwrap(), ConnectionState::Reconnecting);

    script.set_probe(Probe::Healthy);
    let results = manager.health_check_all().await;
    assert!(results["db1"].connected);
    assert_eq!(results["db1"].state, ConnectionState::Connected);
    assert!(manager.list_connections()[0].last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_sweep_schedules_reconnect() {
    let (manager, factory) = scripted_manager(options());
    connect(&manager, "db1", BackendType::Postgres).await;
    let script = factory.script("db1");
    script.set_probe(Probe::Fail);

    let results = manager.health_check_all().await;
    assert_eq!(results["db1"].state, ConnectionState::Reconnecting);
    assert_eq!(script.connects.load(Ordering::SeqCst), 1);

    // One 1s backoff, then the background attempt connects
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(script.connects.load(Ordering::SeqCst), 2);
    assert_eq!(manager.state("db1").unwrap(), ConnectionState::Connected);
    assert!(manager.list_connections()[0].last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_busy_entry_is_skipped() {
    let (manager, factory) = scripted_manager(options());
    connect(&manager, "busy", BackendType::MySQL).await;
    connect(&manager, "idle", BackendType::MySQL).await;
    let busy = factory.script("busy");
    busy.set_query_delay(Duration::from_secs(60));
    busy.set_probe(Probe::Fail);

    let handle = manager
        .get_connection("busy")
        .unwrap()
        .with_timeout(Duration::from_secs(120));
    let query = tokio::spawn(async move { handle.execute_query("SELECT SLEEP(60)", &[]).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let results = manager.health_check_all().await;
    assert!(results["busy"].skipped);
    assert_eq!(results["busy"].state, ConnectionState::Connected);
    assert!(!results["idle"].skipped);
    assert_eq!(busy.probes.load(Ordering::SeqCst), 0);
    assert_eq!(manager.state("busy").unwrap(), ConnectionState::Connected);

    query.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recover_unhealthy() {
    let (manager, factory) = scripted_manager(options());
    for id in ["good", "bad", "fine"] {
        connect(&manager, id, BackendType::MongoDB).await;
    }
    factory.script("good").set_probe(Probe::Down);
    factory.script("bad").set_probe(Probe::Down);
    factory.script("bad").fail_connects(10);

    manager.health_check_all().await;
    let recovered = manager.recover_unhealthy().await;

    assert_eq!(recovered.len(), 2);
    assert!(recovered["good"].is_ok());
    assert_eq!(
        recovered["bad"].as_ref().unwrap_err().code(),
        "CONNECTION_FAILED"
    );
    assert!(!recovered.contains_key("fine"));

    assert_eq!(manager.state("good").unwrap(), ConnectionState::Connected);
    assert_eq!(manager.state("bad").unwrap(), ConnectionState::Error);
    assert_eq!(manager.state("fine").unwrap(), ConnectionState::Connected);
    assert_eq!(factory.script("bad").connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_handle_health_check_does_not_change_state() {
    let (manager, factory) = scripted_manager(options());
    connect(&manager, "db1", BackendType::Neo4j).await;
    factory.script("db1").set_probe(Probe::Down);

    let status = manager.get_connection("db1").unwrap().health_check().await.unwrap();
    assert!(!status.connected);
    assert_eq!(manager.state("db1").unwrap(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_sweeps_on_interval() {
    let (manager, factory) = scripted_manager(options());
    connect(&manager, "db1", BackendType::Postgres).await;
    let script = factory.script("db1");

    let monitor = HealthMonitor::spawn(&manager, Duration::from_secs(30));
    assert_eq!(monitor.interval(), Duration::from_secs(30));

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(script.probes.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(script.probes.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(script.probes.load(Ordering::SeqCst), 2);
    assert!(monitor.is_running());

    monitor.stop().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(script.probes.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_recovers_failed_entry() {
    let (manager, factory) = scripted_manager(options());
    connect(&manager, "db1", BackendType::Postgres).await;
    let script = factory.script("db1");
    script.set_probe(Probe::Fail);

    let monitor = HealthMonitor::spawn(&manager, Duration::from_secs(30));
    // Sweep at 30s marks the entry; recovery reconnects after a 1s backoff
    tokio::time::sleep(Duration::from_secs(35)).await;

    assert_eq!(script.connects.load(Ordering::SeqCst), 2);
    assert_eq!(manager.state("db1").unwrap(), ConnectionState::Connected);
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_monitor_exits_when_manager_dropped() {
    let (manager, _) = scripted_manager(options());
    let monitor = HealthMonitor::spawn(&manager, Duration::from_secs(30));
    assert!(monitor.is_running());

    drop(manager);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!monitor.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_monitor_stops_sweeping() {
    let (manager, factory) = scripted_manager(options());
    connect(&manager, "db1", BackendType::Postgres).await;

    drop(HealthMonitor::spawn(&manager, Duration::from_secs(30)));
    tokio::time::sleep(Duration::from_secs(90)).await;

    assert_eq!(factory.script("db1").probes.load(Ordering::SeqCst), 0);
    assert_eq!(Arc::strong_count(&manager), 1);
}

//! Scripted backend used by the manager integration tests.
//!
//! Behaviour is keyed by the config's host, so each connection in a test can
//! be scripted independently: `factory.script("db1")` controls every adapter
//! that connects with `ConnectionConfig::new("db1", ..)`.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use unidb::db::{AdapterFactory, BackendAdapter, ConnectionManager, ManagerOptions, ReconnectPolicy};
use unidb::models::HealthStatus;
use unidb::{BackendType, ConnectionConfig, ConnectionState, DbError, DbResult, QueryParam, QueryResult};

/// How the adapter answers a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Probe {
    #[default]
    Healthy,
    /// Reports `connected: false`
    Down,
    /// Returns a `HealthCheckFailed` error
    Fail,
    /// Never answers
    Hang,
}

/// Per-host script plus call counters.
#[derive(Debug, Default)]
pub struct Script {
    connect_failures: AtomicUsize,
    connect_delay: Mutex<Duration>,
    query_delay: Mutex<Duration>,
    probe: Mutex<Probe>,
    fail_disconnect: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub queries: AtomicUsize,
    pub statements: AtomicUsize,
    pub probes: AtomicUsize,
}

impl Script {
    /// Fail the next `n` connect calls.
    pub fn fail_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = delay;
    }

    pub fn set_probe(&self, probe: Probe) {
        *self.probe.lock().unwrap() = probe;
    }

    pub fn fail_disconnects(&self) {
        self.fail_disconnect.store(true, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct Scripts {
    by_host: Mutex<HashMap<String, Arc<Script>>>,
}

impl Scripts {
    fn get(&self, host: &str) -> Arc<Script> {
        self.by_host
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .clone()
    }
}

pub struct ScriptedAdapter {
    scripts: Arc<Scripts>,
    script: Option<Arc<Script>>,
    connected: bool,
}

impl ScriptedAdapter {
    fn session(&self) -> DbResult<&Arc<Script>> {
        match (&self.script, self.connected) {
            (Some(script), true) => Ok(script),
            _ => Err(DbError::not_connected(ConnectionState::Disconnected)),
        }
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    async fn connect(&mut self, config: &ConnectionConfig, _timeout: Duration) -> DbResult<()> {
        if self.connected {
            return Err(DbError::already_connected("scripted session is open"));
        }
        let script = self.scripts.get(&config.host);
        let attempt = script.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *script.connect_delay.lock().unwrap();
        self.script = Some(script.clone());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if script.take_failure() {
            return Err(DbError::connection_failed(format!(
                "{} refused connect #{}",
                config.host, attempt
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> DbResult<()> {
        let was_connected = std::mem::replace(&mut self.connected, false);
        let Some(script) = &self.script else {
            return Ok(());
        };
        if was_connected {
            script.disconnects.fetch_add(1, Ordering::SeqCst);
            if script.fail_disconnect.load(Ordering::SeqCst) {
                return Err(DbError::connection_failed("socket already closed"));
            }
        }
        Ok(())
    }

    async fn execute_query(
        &mut self,
        query: &str,
        params: &[QueryParam],
        _timeout: Duration,
    ) -> DbResult<QueryResult> {
        let script = self.session()?.clone();
        script.queries.fetch_add(1, Ordering::SeqCst);
        let delay = *script.query_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let echoed: Vec<_> = params.iter().map(QueryParam::to_json).collect();
        Ok(QueryResult::new(
            vec!["query".to_string(), "params".to_string()],
            vec![vec![json!(query), json!(echoed)]],
            delay,
        ))
    }

    async fn execute_ddl(&mut self, _statement: &str, _timeout: Duration) -> DbResult<()> {
        self.session()?.statements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&mut self, _timeout: Duration) -> DbResult<HealthStatus> {
        let script = self.session()?.clone();
        script.probes.fetch_add(1, Ordering::SeqCst);
        let probe = *script.probe.lock().unwrap();
        match probe {
            Probe::Healthy => Ok(HealthStatus::healthy(0.5)),
            Probe::Down => Ok(HealthStatus::unhealthy(0.5)),
            Probe::Fail => Err(DbError::health_check_failed("ping rejected")),
            Probe::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Arc<Scripts>,
    pub created: AtomicUsize,
}

impl ScriptedFactory {
    /// Script for connections whose config host is `host`.
    pub fn script(&self, host: &str) -> Arc<Script> {
        self.scripts.get(host)
    }
}

impl AdapterFactory for ScriptedFactory {
    fn create(&self, _backend: BackendType) -> DbResult<Box<dyn BackendAdapter>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedAdapter {
            scripts: self.scripts.clone(),
            script: None,
            connected: false,
        }))
    }
}

/// Config whose host names the script.
pub fn config(host: &str) -> ConnectionConfig {
    ConnectionConfig::new(host, 5432)
}

/// Deterministic policy: 1s, 2s, 4s, ... capped at 30s.
pub fn fixed_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        jitter_fraction: 0.0,
        max_attempts,
    }
}

pub fn scripted_manager(options: ManagerOptions) -> (Arc<ConnectionManager>, Arc<ScriptedFactory>) {
    let factory = Arc::new(ScriptedFactory::default());
    let manager = Arc::new(ConnectionManager::with_factory(options, factory.clone()));
    (manager, factory)
}

/// Register `id` with a config whose host is also `id`.
pub async fn connect(manager: &ConnectionManager, id: &str, backend: BackendType) {
    manager
        .create_connection(id, backend, config(id))
        .await
        .unwrap_or_else(|e| panic!("create_connection({}) failed: {}", id, e));
}

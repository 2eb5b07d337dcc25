//! Connection manager.
//!
//! Owns a bounded registry of named connections across backend types. Registry
//! bookkeeping (capacity, ids, insertion and removal) runs under one short,
//! synchronous lock that is never held across an await. Each entry's adapter
//! sits behind an async mutex, so operations on one id are queued while
//! different ids run in parallel.
//!
//! `create_connection` reserves a slot before connecting and releases it if the
//! connect fails or the caller's future is dropped; a half-registered entry is
//! never visible to other callers.

use crate::db::adapter::{
    AdapterFactory, BackendAdapter, DEFAULT_HEALTH_TIMEOUT, DriverFactory, duration_ms,
    with_deadline,
};
use crate::db::policy::ReconnectPolicy;
use crate::db::state::{InvalidTransition, StateEvent, StateMachine};
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendType, ConnectionConfig, ConnectionState, ConnectionSummary, HealthResult,
    HealthStatus, ManagerStats, QueryParam, QueryResult,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{MutexGuard as AdapterGuard, watch};
use tracing::{debug, error, info, warn};

/// Default number of registry slots.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

/// Default deadline for `connect` and `disconnect`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for statements.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Manager tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    /// Per-entry probe deadline used by `health_check_all`.
    pub health_timeout: Duration,
    pub policy: ReconnectPolicy,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            policy: ReconnectPolicy::default(),
        }
    }
}

impl ManagerOptions {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Validate option values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("query_timeout", self.query_timeout),
            ("health_timeout", self.health_timeout),
        ] {
            if value.is_zero() {
                return Err(format!("{} must be greater than zero", name));
            }
        }
        self.policy.validate()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
struct EntryStatus {
    machine: StateMachine,
    last_health_check_at: Option<DateTime<Utc>>,
    last_error: Option<DbError>,
}

/// One registered connection: the adapter plus its lifecycle bookkeeping.
struct ConnectionEntry {
    id: String,
    backend: BackendType,
    config: ConnectionConfig,
    adapter: tokio::sync::Mutex<Box<dyn BackendAdapter>>,
    status: Mutex<EntryStatus>,
    created_at: DateTime<Utc>,
    closed: watch::Sender<bool>,
}

impl ConnectionEntry {
    fn new(
        id: String,
        backend: BackendType,
        config: ConnectionConfig,
        adapter: Box<dyn BackendAdapter>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            backend,
            config,
            adapter: tokio::sync::Mutex::new(adapter),
            status: Mutex::new(EntryStatus {
                machine: StateMachine::new(),
                last_health_check_at: None,
                last_error: None,
            }),
            created_at: Utc::now(),
            closed,
        }
    }

    fn state(&self) -> ConnectionState {
        lock(&self.status).machine.state()
    }

    fn transition(&self, event: StateEvent) -> DbResult<ConnectionState> {
        let mut status = lock(&self.status);
        let from = status.machine.state();
        let to = status
            .machine
            .apply(event)
            .map_err(|e| self.transition_error(e))?;
        drop(status);

        debug!(
            connection_id = %self.id,
            from = %from,
            to = %to,
            event = %event,
            "State transition"
        );
        Ok(to)
    }

    fn transition_error(&self, err: InvalidTransition) -> DbError {
        if err.from == ConnectionState::Closed {
            DbError::not_found(&self.id)
        } else {
            DbError::not_connected(err.from)
        }
    }

    fn record_error(&self, err: &DbError) {
        lock(&self.status).last_error = Some(err.clone());
    }

    fn clear_error(&self) {
        lock(&self.status).last_error = None;
    }

    fn ensure_connected(&self) -> DbResult<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(DbError::not_connected(state)),
        }
    }

    /// Move to `Closed` and wake anything waiting on the close signal.
    fn mark_closed(&self) {
        if let Err(e) = self.transition(StateEvent::Close) {
            debug!(connection_id = %self.id, error = %e, "Entry already closed");
        }
        self.closed.send_replace(true);
    }

    /// Resolves once the entry has been closed.
    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // Err only when the sender is gone, which means the entry is gone too
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn summary(&self) -> ConnectionSummary {
        let status = lock(&self.status);
        ConnectionSummary {
            id: self.id.clone(),
            backend_type: self.backend,
            host: self.config.host.clone(),
            port: self.config.port,
            database: self.config.database.clone(),
            state: status.machine.state(),
            created_at: self.created_at,
            last_health_check_at: status.last_health_check_at,
            last_error: status.last_error.as_ref().map(ToString::to_string),
        }
    }

    /// Lock the adapter within `timeout`, then re-check the state.
    async fn acquire(&self, timeout: Duration) -> DbResult<AdapterGuard<'_, Box<dyn BackendAdapter>>> {
        self.ensure_connected()?;
        let adapter = with_deadline("acquire connection", timeout, async {
            Ok(self.adapter.lock().await)
        })
        .await?;
        // State may have changed while queued behind another caller
        self.ensure_connected()?;
        Ok(adapter)
    }

    async fn execute_query(
        &self,
        query: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> DbResult<QueryResult> {
        let start = Instant::now();
        let mut adapter = self.acquire(timeout).await?;
        let remaining = timeout.saturating_sub(start.elapsed());

        let result = adapter.execute_query(query, params, remaining).await;
        match &result {
            Ok(r) => debug!(
                connection_id = %self.id,
                rows = r.row_count(),
                elapsed_ms = r.execution_time_ms(),
                "Query executed"
            ),
            Err(e) => {
                debug!(connection_id = %self.id, error = %e, "Query failed");
                self.record_error(e);
            }
        }
        result
    }

    async fn execute_ddl(&self, statement: &str, timeout: Duration) -> DbResult<()> {
        let start = Instant::now();
        let mut adapter = self.acquire(timeout).await?;
        let remaining = timeout.saturating_sub(start.elapsed());

        let result = adapter.execute_ddl(statement, remaining).await;
        if let Err(e) = &result {
            debug!(connection_id = %self.id, error = %e, "Statement failed");
            self.record_error(e);
        }
        result
    }

    /// Run the reconnect policy against this entry.
    ///
    /// With [`Recovery::Explicit`] the loop starts from `Disconnected`, `Error`
    /// or `Reconnecting`. With [`Recovery::Scheduled`] it only works on an entry
    /// that is still `Reconnecting` once the adapter lock is held, and reports
    /// the outcome of whoever got there first otherwise.
    async fn reconnect(
        &self,
        policy: &ReconnectPolicy,
        connect_timeout: Duration,
        recovery: Recovery,
    ) -> DbResult<()> {
        let mut adapter = tokio::select! {
            guard = self.adapter.lock() => guard,
            _ = self.wait_closed() => return Err(DbError::not_found(&self.id)),
        };

        match (self.state(), recovery) {
            (ConnectionState::Connected, _) => {
                debug!(connection_id = %self.id, "Already connected");
                return Ok(());
            }
            (ConnectionState::Closed, _) => return Err(DbError::not_found(&self.id)),
            (ConnectionState::Reconnecting, _) => {}
            (state, Recovery::Scheduled) => {
                let last_error = lock(&self.status).last_error.clone();
                return Err(last_error.unwrap_or_else(|| DbError::not_connected(state)));
            }
            (ConnectionState::Disconnected, Recovery::Explicit) => {
                self.transition(StateEvent::Connect)?;
            }
            (ConnectionState::Error, Recovery::Explicit) => {
                self.transition(StateEvent::Reconnect)?;
            }
            (ConnectionState::Connecting, Recovery::Explicit) => {}
        }

        let mut failed = 0;
        let mut last_error = None;
        while !policy.is_exhausted(failed) {
            let attempt = failed + 1;
            let delay = policy.jittered_delay(attempt);
            debug!(
                connection_id = %self.id,
                attempt = attempt,
                delay_ms = duration_ms(delay),
                "Waiting before reconnect attempt"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wait_closed() => return Err(DbError::not_found(&self.id)),
            }

            if let Err(e) = adapter.disconnect().await {
                debug!(connection_id = %self.id, error = %e, "Stale session did not close cleanly");
            }

            let connected = tokio::select! {
                result = adapter.connect(&self.config, connect_timeout) => result,
                _ = self.wait_closed() => return Err(DbError::not_found(&self.id)),
            };

            match connected {
                Ok(()) => {
                    self.transition(StateEvent::Succeeded)?;
                    self.clear_error();
                    info!(connection_id = %self.id, attempt = attempt, "Reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        connection_id = %self.id,
                        attempt = attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    self.record_error(&e);
                    last_error = Some(e);
                    failed += 1;
                }
            }
        }

        let exhausted = match self.state() {
            ConnectionState::Reconnecting => StateEvent::RetriesExhausted,
            _ => StateEvent::Failed,
        };
        self.transition(exhausted)?;
        error!(
            connection_id = %self.id,
            attempts = failed,
            "Reconnect attempts exhausted"
        );
        Err(last_error.unwrap_or_else(|| {
            DbError::connection_failed(format!("Reconnect of '{}' made no attempts", self.id))
        }))
    }

    /// Disconnect the adapter of an entry that has been marked `Closed`.
    ///
    /// Waits at most `limit` for the adapter lock. If an in-flight statement
    /// still holds it, the disconnect is handed to a background task that runs
    /// as soon as the lock is released.
    async fn release(self: &Arc<Self>, limit: Duration) -> DbResult<()> {
        let Ok(mut adapter) = tokio::time::timeout(limit, self.adapter.lock()).await else {
            info!(
                connection_id = %self.id,
                "Adapter busy; disconnect deferred until the current operation finishes"
            );
            let entry = Arc::clone(self);
            tokio::spawn(async move {
                let mut adapter = entry.adapter.lock().await;
                match with_deadline("close", limit, adapter.disconnect()).await {
                    Ok(()) => debug!(connection_id = %entry.id, "Deferred disconnect finished"),
                    Err(e) => {
                        warn!(connection_id = %entry.id, error = %e, "Deferred disconnect failed")
                    }
                }
            });
            return Ok(());
        };

        let result = with_deadline("close", limit, adapter.disconnect()).await;
        if let Err(e) = &result {
            warn!(connection_id = %self.id, error = %e, "Disconnect during close failed");
        }
        result
    }
}

/// How [`ConnectionEntry::reconnect`] treats an entry that is not `Reconnecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Caller asked for it; restart from `Disconnected` or `Error`.
    Explicit,
    /// Follow-up to a failed health check; leave other states alone.
    Scheduled,
}

/// Reference to a registered connection.
///
/// Every call re-checks the entry's state, so a handle kept past
/// `close_connection` fails with `NotConnected` and never reaches the adapter.
#[derive(Clone)]
pub struct ConnectionHandle {
    entry: Arc<ConnectionEntry>,
    query_timeout: Duration,
    health_timeout: Duration,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.entry.id)
            .field("backend", &self.entry.backend)
            .field("state", &self.entry.state())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn backend_type(&self) -> BackendType {
        self.entry.backend
    }

    pub fn state(&self) -> ConnectionState {
        self.entry.state()
    }

    /// Use `timeout` instead of the manager's query deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub async fn execute_query(&self, query: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.entry
            .execute_query(query, params, self.query_timeout)
            .await
    }

    pub async fn execute_ddl(&self, statement: &str) -> DbResult<()> {
        self.entry.execute_ddl(statement, self.query_timeout).await
    }

    /// Probe the adapter directly; does not change the entry's state.
    pub async fn health_check(&self) -> DbResult<HealthStatus> {
        let mut adapter = self.entry.acquire(self.health_timeout).await?;
        with_deadline(
            "health check",
            self.health_timeout,
            adapter.health_check(self.health_timeout),
        )
        .await
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Arc<ConnectionEntry>>,
    /// Ids whose `connect` is in flight; they hold a slot but are not visible.
    reserved: HashSet<String>,
}

impl Registry {
    fn occupied(&self) -> usize {
        self.entries.len() + self.reserved.len()
    }
}

/// Slot held by an in-flight `create_connection`; released on drop unless committed.
struct Reservation<'a> {
    registry: &'a RwLock<Registry>,
    id: String,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, entry: Arc<ConnectionEntry>) {
        let mut registry = write(self.registry);
        registry.reserved.remove(&self.id);
        registry.entries.insert(self.id.clone(), entry);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            write(self.registry).reserved.remove(&self.id);
        }
    }
}

fn read(registry: &RwLock<Registry>) -> RwLockReadGuard<'_, Registry> {
    registry.read().unwrap_or_else(|e| e.into_inner())
}

fn write(registry: &RwLock<Registry>) -> RwLockWriteGuard<'_, Registry> {
    registry.write().unwrap_or_else(|e| e.into_inner())
}

pub struct ConnectionManager {
    registry: RwLock<Registry>,
    factory: Arc<dyn AdapterFactory>,
    options: ManagerOptions,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.len())
            .field("options", &self.options)
            .finish()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl ConnectionManager {
    /// Create a manager backed by the real database drivers.
    pub fn new(options: ManagerOptions) -> Self {
        Self::with_factory(options, Arc::new(DriverFactory))
    }

    /// Create a manager that instantiates adapters through `factory`.
    pub fn with_factory(options: ManagerOptions, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            factory,
            options,
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn max_connections(&self) -> usize {
        self.options.max_connections
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        read(&self.registry).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        read(&self.registry).entries.contains_key(id)
    }

    fn entry(&self, id: &str) -> DbResult<Arc<ConnectionEntry>> {
        read(&self.registry)
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::not_found(id))
    }

    fn snapshot(&self) -> Vec<Arc<ConnectionEntry>> {
        read(&self.registry).entries.values().cloned().collect()
    }

    fn reserve(&self, id: &str) -> DbResult<Reservation<'_>> {
        let mut registry = write(&self.registry);
        if registry.entries.contains_key(id) || registry.reserved.contains(id) {
            return Err(DbError::duplicate_id(id));
        }
        if registry.occupied() >= self.options.max_connections {
            return Err(DbError::capacity_exceeded(self.options.max_connections));
        }
        registry.reserved.insert(id.to_string());
        Ok(Reservation {
            registry: &self.registry,
            id: id.to_string(),
            committed: false,
        })
    }

    /// Connect a new adapter and register it under `id`.
    pub async fn create_connection(
        &self,
        id: &str,
        backend: BackendType,
        config: ConnectionConfig,
    ) -> DbResult<()> {
        let reservation = self.reserve(id)?;
        let adapter = self.factory.create(backend)?;
        let entry = Arc::new(ConnectionEntry::new(id.to_string(), backend, config, adapter));

        info!(
            connection_id = %id,
            backend = %backend,
            endpoint = %entry.config.endpoint(),
            "Connecting"
        );

        entry.transition(StateEvent::Connect)?;
        let connected = {
            let mut adapter = entry.adapter.lock().await;
            adapter
                .connect(&entry.config, self.options.connect_timeout)
                .await
        };

        if let Err(e) = connected {
            entry.transition(StateEvent::Failed)?;
            warn!(connection_id = %id, backend = %backend, error = %e, "Connect failed");
            return Err(e);
        }

        entry.transition(StateEvent::Succeeded)?;
        reservation.commit(entry);
        info!(connection_id = %id, backend = %backend, "Connected");
        Ok(())
    }

    /// Handle to a registered connection.
    pub fn get_connection(&self, id: &str) -> DbResult<ConnectionHandle> {
        Ok(ConnectionHandle {
            entry: self.entry(id)?,
            query_timeout: self.options.query_timeout,
            health_timeout: self.options.health_timeout,
        })
    }

    pub fn state(&self, id: &str) -> DbResult<ConnectionState> {
        Ok(self.entry(id)?.state())
    }

    /// Run a read operation on `id`. Fails fast unless the entry is `Connected`.
    pub async fn execute_query(
        &self,
        id: &str,
        query: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        self.entry(id)?
            .execute_query(query, params, self.options.query_timeout)
            .await
    }

    /// Run a write or structural operation on `id`.
    pub async fn execute_ddl(&self, id: &str, statement: &str) -> DbResult<()> {
        self.entry(id)?
            .execute_ddl(statement, self.options.query_timeout)
            .await
    }

    /// Release the adapter's session but keep the entry and its slot.
    pub async fn disconnect(&self, id: &str) -> DbResult<()> {
        let entry = self.entry(id)?;
        let mut adapter = with_deadline("disconnect", self.options.connect_timeout, async {
            Ok(entry.adapter.lock().await)
        })
        .await?;

        entry.transition(StateEvent::Disconnect)?;
        info!(connection_id = %id, "Disconnecting");
        let result = adapter.disconnect().await;
        if let Err(e) = &result {
            warn!(connection_id = %id, error = %e, "Disconnect reported an error");
            entry.record_error(e);
        }
        result
    }

    /// Re-establish the session for `id`, following the reconnect policy.
    ///
    /// Works from `Disconnected`, `Error` and `Reconnecting`; a `Connected`
    /// entry is left alone. On exhaustion the entry moves to `Error` and the
    /// last connect error is returned. Closing the entry aborts the loop with
    /// `NotFound`.
    pub async fn reconnect(&self, id: &str) -> DbResult<()> {
        self.entry(id)?
            .reconnect(
                &self.options.policy,
                self.options.connect_timeout,
                Recovery::Explicit,
            )
            .await
    }

    /// Start a background reconnect for an entry a probe just marked unhealthy.
    fn schedule_recovery(&self, entry: &Arc<ConnectionEntry>) {
        let entry = Arc::clone(entry);
        let policy = self.options.policy.clone();
        let connect_timeout = self.options.connect_timeout;
        debug!(connection_id = %entry.id, "Reconnect scheduled");
        tokio::spawn(async move {
            let outcome = entry
                .reconnect(&policy, connect_timeout, Recovery::Scheduled)
                .await;
            if let Err(e) = outcome {
                warn!(connection_id = %entry.id, error = %e, "Scheduled reconnect failed");
            }
        });
    }

    async fn probe(&self, entry: &Arc<ConnectionEntry>) -> HealthResult {
        let timeout = self.options.health_timeout;
        let checked_at = Utc::now();

        let skipped = |state: ConnectionState| HealthResult {
            connected: state == ConnectionState::Connected,
            ping_time_ms: 0.0,
            state,
            skipped: true,
            error: None,
            checked_at,
        };

        // A busy adapter is mid-query or mid-reconnect; neither is a failed probe
        let Ok(mut adapter) = entry.adapter.try_lock() else {
            return skipped(entry.state());
        };
        let before = entry.state();
        if !before.is_probed() {
            return skipped(before);
        }

        let start = Instant::now();
        let outcome = with_deadline("health check", timeout, adapter.health_check(timeout)).await;
        drop(adapter);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        lock(&entry.status).last_health_check_at = Some(checked_at);

        let failure = match outcome {
            Ok(status) if status.connected => {
                if before == ConnectionState::Reconnecting
                    && entry.transition(StateEvent::Succeeded).is_ok()
                {
                    entry.clear_error();
                    info!(connection_id = %entry.id, "Connection recovered");
                }
                return HealthResult {
                    connected: true,
                    ping_time_ms: status.ping_time_ms,
                    state: entry.state(),
                    skipped: false,
                    error: None,
                    checked_at,
                };
            }
            Ok(_) => DbError::health_check_failed("Backend reported itself unavailable"),
            Err(e) => e,
        };

        entry.record_error(&failure);
        if before == ConnectionState::Connected
            && entry.transition(StateEvent::HealthCheckFailed).is_ok()
        {
            warn!(
                connection_id = %entry.id,
                backend = %entry.backend,
                error = %failure,
                "Health check failed; connection marked for reconnect"
            );
            self.schedule_recovery(entry);
        }
        HealthResult {
            connected: false,
            ping_time_ms: elapsed_ms,
            state: entry.state(),
            skipped: false,
            error: Some(failure.to_string()),
            checked_at,
        }
    }

    /// Probe every `Connected` or `Reconnecting` entry concurrently.
    ///
    /// Failed probes move `Connected` entries to `Reconnecting` and start a
    /// background reconnect for each; passing probes move `Reconnecting`
    /// entries back to `Connected`. Never fails as a whole.
    pub async fn health_check_all(&self) -> HashMap<String, HealthResult> {
        let entries: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|entry| entry.state().is_probed())
            .collect();

        let probes = entries.iter().map(|entry| async move {
            (entry.id.clone(), self.probe(entry).await)
        });
        let results: HashMap<_, _> = join_all(probes).await.into_iter().collect();

        debug!(probed = results.len(), "Health sweep finished");
        results
    }

    /// Reconnect every `Reconnecting` entry concurrently.
    ///
    /// An entry whose scheduled reconnect already finished reports that
    /// outcome instead of starting another round of attempts.
    pub async fn recover_unhealthy(&self) -> HashMap<String, DbResult<()>> {
        let entries: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|entry| entry.state() == ConnectionState::Reconnecting)
            .collect();

        let policy = &self.options.policy;
        let connect_timeout = self.options.connect_timeout;
        let attempts = entries.iter().map(|entry| async move {
            let result = entry
                .reconnect(policy, connect_timeout, Recovery::Scheduled)
                .await;
            (entry.id.clone(), result)
        });
        join_all(attempts).await.into_iter().collect()
    }

    /// Snapshot of every entry, ordered by id.
    pub fn list_connections(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<_> = self.snapshot().iter().map(|e| e.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn get_stats(&self) -> ManagerStats {
        let entries = self.snapshot();
        let mut by_type = HashMap::new();
        let mut by_state = HashMap::new();
        for entry in &entries {
            *by_type.entry(entry.backend).or_insert(0) += 1;
            *by_state.entry(entry.state()).or_insert(0) += 1;
        }

        let max_connections = self.options.max_connections;
        ManagerStats {
            total_connections: entries.len(),
            max_connections,
            by_type,
            by_state,
            utilization: if max_connections == 0 {
                0.0
            } else {
                entries.len() as f64 / max_connections as f64
            },
        }
    }

    /// Remove `id`, mark it `Closed` and disconnect its adapter.
    ///
    /// The slot is freed before the adapter is disconnected, and the close
    /// succeeds even if the disconnect fails. An adapter still busy after
    /// `connect_timeout` is disconnected once its current operation finishes.
    /// A second call returns `NotFound`.
    pub async fn close_connection(&self, id: &str) -> DbResult<()> {
        let entry = {
            let mut registry = write(&self.registry);
            let entry = registry
                .entries
                .remove(id)
                .ok_or_else(|| DbError::not_found(id))?;
            entry.mark_closed();
            entry
        };

        // Errors are logged by `release`; the entry is gone either way
        let _ = entry.release(self.options.connect_timeout).await;
        info!(connection_id = %id, "Connection closed");
        Ok(())
    }

    /// Close every entry, collecting disconnect failures instead of stopping.
    pub async fn close_all(&self) -> Result<(), Vec<DbError>> {
        let entries: Vec<_> = {
            let mut registry = write(&self.registry);
            let drained: Vec<_> = registry.entries.drain().map(|(_, e)| e).collect();
            for entry in &drained {
                entry.mark_closed();
            }
            drained
        };

        let count = entries.len();
        let limit = self.options.connect_timeout;
        let results = join_all(entries.iter().map(|entry| entry.release(limit))).await;
        let errors: Vec<DbError> = results.into_iter().filter_map(Result::err).collect();

        if errors.is_empty() {
            info!(closed = count, "All connections closed");
            Ok(())
        } else {
            warn!(closed = count, failures = errors.len(), "Connections closed with errors");
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adapter whose connect fails a fixed number of times.
    struct FlakyAdapter {
        connected: bool,
        failures_left: Arc<AtomicUsize>,
        queries: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendAdapter for FlakyAdapter {
        async fn connect(&mut self, _: &ConnectionConfig, _: Duration) -> DbResult<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DbError::connection_failed("refused"));
            }
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> DbResult<()> {
            self.connected = false;
            Ok(())
        }

        async fn execute_query(
            &mut self,
            _: &str,
            _: &[QueryParam],
            _: Duration,
        ) -> DbResult<QueryResult> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(QueryResult::empty(Duration::ZERO))
        }

        async fn execute_ddl(&mut self, _: &str, _: Duration) -> DbResult<()> {
            Ok(())
        }

        async fn health_check(&mut self, _: Duration) -> DbResult<HealthStatus> {
            if self.connected {
                Ok(HealthStatus::healthy(0.1))
            } else {
                Ok(HealthStatus::unhealthy(0.1))
            }
        }
    }

    #[derive(Default)]
    struct FlakyFactory {
        failures: Arc<AtomicUsize>,
        queries: Arc<AtomicUsize>,
    }

    impl AdapterFactory for FlakyFactory {
        fn create(&self, _: BackendType) -> DbResult<Box<dyn BackendAdapter>> {
            Ok(Box::new(FlakyAdapter {
                connected: false,
                failures_left: self.failures.clone(),
                queries: self.queries.clone(),
            }))
        }
    }

    fn manager(max: usize) -> (ConnectionManager, Arc<FlakyFactory>) {
        let factory = Arc::new(FlakyFactory::default());
        let options = ManagerOptions::default().with_max_connections(max);
        (ConnectionManager::with_factory(options, factory.clone()), factory)
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("localhost", 5432)
    }

    #[test]
    fn test_options_validate() {
        assert!(ManagerOptions::default().validate().is_ok());
        assert!(ManagerOptions::default().with_max_connections(0).validate().is_err());
        assert!(
            ManagerOptions::default()
                .with_health_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_failed_connect_releases_slot() {
        let (manager, factory) = manager(1);
        factory.failures.store(1, Ordering::SeqCst);

        let err = manager
            .create_connection("db1", BackendType::Postgres, config())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONNECTION_FAILED");
        assert!(manager.is_empty());
        assert!(read(&manager.registry).reserved.is_empty());

        manager
            .create_connection("db1", BackendType::Postgres, config())
            .await
            .unwrap();
        assert_eq!(manager.state("db1").unwrap(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (manager, _) = manager(4);
        manager
            .create_connection("db1", BackendType::Postgres, config())
            .await
            .unwrap();
        let err = manager
            .create_connection("db1", BackendType::Redis, config())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateId { .. }));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_dropped_create_releases_reservation() {
        let (manager, _) = manager(1);
        {
            let reservation = manager.reserve("db1").unwrap();
            assert!(matches!(
                manager.reserve("db2"),
                Err(DbError::CapacityExceeded { max_connections: 1 })
            ));
            drop(reservation);
        }
        assert!(manager.reserve("db2").is_ok());
    }

    #[tokio::test]
    async fn test_query_blocked_unless_connected() {
        let (manager, factory) = manager(2);
        manager
            .create_connection("db1", BackendType::Postgres, config())
            .await
            .unwrap();
        manager.disconnect("db1").await.unwrap();

        let err = manager.execute_query("db1", "SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::NotConnected {
                state: ConnectionState::Disconnected
            }
        ));
        assert_eq!(factory.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_from_disconnected() {
        let (manager, _) = manager(2);
        manager
            .create_connection("db1", BackendType::Postgres, config())
            .await
            .unwrap();
        manager.disconnect("db1").await.unwrap();
        manager.reconnect("db1").await.unwrap();
        assert_eq!(manager.state("db1").unwrap(), ConnectionState::Connected);
        manager.execute_query("db1", "SELECT 1", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_after_close_never_reaches_adapter() {
        let (manager, factory) = manager(2);
        manager
            .create_connection("db1", BackendType::Postgres, config())
            .await
            .unwrap();
        let handle = manager.get_connection("db1").unwrap();
        manager.close_connection("db1").await.unwrap();

        assert_eq!(handle.state(), ConnectionState::Closed);
        let err = handle.execute_query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::NotConnected {
                state: ConnectionState::Closed
            }
        ));
        assert_eq!(factory.queries.load(Ordering::SeqCst), 0);
        assert!(matches!(
            manager.get_connection("db1"),
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_summary_reports_last_error() {
        let (manager, _) = manager(2);
        manager
            .create_connection("db1", BackendType::Redis, config().with_database("0"))
            .await
            .unwrap();
        let entry = manager.entry("db1").unwrap();
        entry.record_error(&DbError::query_failed("boom"));

        let summaries = manager.list_connections();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].backend_type, BackendType::Redis);
        assert_eq!(summaries[0].database.as_deref(), Some("0"));
        assert_eq!(summaries[0].last_error.as_deref(), Some("Query failed: boom"));
    }
}

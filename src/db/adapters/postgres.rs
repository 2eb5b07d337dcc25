//! PostgreSQL adapter on a sqlx `PgPool`.

use super::sql::{PoolSettings, bind_postgres_param, rows_to_result};
use crate::config::PoolOptions;
use crate::db::adapter::{BackendAdapter, already_connected, not_connected, with_deadline};
use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionConfig, HealthStatus, QueryParam, QueryResult};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Default)]
pub struct PostgresAdapter {
    pool: Option<PgPool>,
}

impl PostgresAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self) -> DbResult<&PgPool> {
        self.pool.as_ref().ok_or_else(not_connected)
    }
}

/// Build connect options from discrete fields so credentials never pass through a URL.
pub(crate) fn connect_options(config: &ConnectionConfig) -> DbResult<PgConnectOptions> {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port);
    if let Some(user) = &config.username {
        options = options.username(user);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    if let Some(mode) = config.param_str("sslmode") {
        let mode = PgSslMode::from_str(&mode).map_err(|e| {
            DbError::connection_failed(format!("Invalid sslmode '{}': {}", mode, e))
        })?;
        options = options.ssl_mode(mode);
    }
    if let Some(name) = config.param_str("application_name") {
        options = options.application_name(&name);
    }
    Ok(options)
}

#[async_trait]
impl BackendAdapter for PostgresAdapter {
    async fn connect(&mut self, config: &ConnectionConfig, timeout: Duration) -> DbResult<()> {
        if self.pool.is_some() {
            return Err(already_connected(BackendType::Postgres));
        }

        let options = connect_options(config)?;
        let settings = PoolSettings::resolve(&PoolOptions::from_config(config), timeout)?;

        let pool = with_deadline("postgres connect", timeout, async {
            PgPoolOptions::new()
                .min_connections(settings.min_connections)
                .max_connections(settings.max_connections)
                .acquire_timeout(settings.acquire_timeout)
                .idle_timeout(Some(settings.idle_timeout))
                .test_before_acquire(true)
                .connect_with(options)
                .await
                .map_err(DbError::from_sqlx_connect)
        })
        .await?;

        debug!(host = %config.host, port = config.port, "PostgreSQL pool opened");
        self.pool = Some(pool);
        Ok(())
    }

    async fn disconnect(&mut self) -> DbResult<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn execute_query(
        &mut self,
        query: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> DbResult<QueryResult> {
        let pool = self.pool()?;
        let start = Instant::now();

        let rows = with_deadline("postgres query", timeout, async {
            // Raw SQL when there are no params avoids prepared-statement restrictions
            let fetched = if params.is_empty() {
                use sqlx::Executor;
                pool.fetch_all(query).await
            } else {
                let mut q = sqlx::query(query);
                for param in params {
                    q = bind_postgres_param(q, param);
                }
                q.fetch_all(pool).await
            };
            fetched.map_err(DbError::from_sqlx_query)
        })
        .await?;

        Ok(rows_to_result(rows, start))
    }

    async fn execute_ddl(&mut self, statement: &str, timeout: Duration) -> DbResult<()> {
        let pool = self.pool()?;

        let result = with_deadline("postgres ddl", timeout, async {
            use sqlx::Executor;
            pool.execute(statement)
                .await
                .map_err(DbError::from_sqlx_query)
        })
        .await?;

        debug!(rows_affected = result.rows_affected(), "PostgreSQL statement executed");
        Ok(())
    }

    async fn health_check(&mut self, timeout: Duration) -> DbResult<HealthStatus> {
        let pool = self.pool()?;
        let start = Instant::now();

        with_deadline("postgres health check", timeout, async {
            sqlx::query("SELECT 1")
                .execute(pool)
                .await
                .map_err(|e| DbError::health_check_failed_with("PostgreSQL ping failed", e))
        })
        .await?;

        Ok(HealthStatus::healthy(start.elapsed().as_secs_f64() * 1000.0))
    }
}

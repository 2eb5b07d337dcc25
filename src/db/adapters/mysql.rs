//! MySQL / MariaDB adapter on a sqlx `MySqlPool`.

use super::sql::{PoolSettings, bind_mysql_param, rows_to_result};
use crate::config::PoolOptions;
use crate::db::adapter::{BackendAdapter, already_connected, not_connected, with_deadline};
use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionConfig, HealthStatus, QueryParam, QueryResult};
use async_trait::async_trait;
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Default)]
pub struct MySqlAdapter {
    pool: Option<MySqlPool>,
}

impl MySqlAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self) -> DbResult<&MySqlPool> {
        self.pool.as_ref().ok_or_else(not_connected)
    }
}

pub(crate) fn connect_options(config: &ConnectionConfig) -> DbResult<MySqlConnectOptions> {
    let mut options = MySqlConnectOptions::new()
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
    if let Some(mode) = config.param_str("ssl_mode") {
        let mode = MySqlSslMode::from_str(&mode).map_err(|e| {
            DbError::connection_failed(format!("Invalid ssl_mode '{}': {}", mode, e))
        })?;
        options = options.ssl_mode(mode);
    }
    if let Some(charset) = config.param_str("charset") {
        options = options.charset(&charset);
    }
    Ok(options)
}

#[async_trait]
impl BackendAdapter for MySqlAdapter {
    async fn connect(&mut self, config: &ConnectionConfig, timeout: Duration) -> DbResult<()> {
        if self.pool.is_some() {
            return Err(already_connected(BackendType::MySQL));
        }

        let options = connect_options(config)?;
        let settings = PoolSettings::resolve(&PoolOptions::from_config(config), timeout)?;

        let pool = with_deadline("mysql connect", timeout, async {
            MySqlPoolOptions::new()
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

        debug!(host = %config.host, port = config.port, "MySQL pool opened");
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

        let rows = with_deadline("mysql query", timeout, async {
            let fetched = if params.is_empty() {
                use sqlx::Executor;
                pool.fetch_all(query).await
            } else {
                let mut q = sqlx::query(query);
                for param in params {
                    q = bind_mysql_param(q, param);
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

        // Executed unprepared; statements like CREATE PROCEDURE reject the prepared protocol
        let result = with_deadline("mysql ddl", timeout, async {
            use sqlx::Executor;
            pool.execute(statement)
                .await
                .map_err(DbError::from_sqlx_query)
        })
        .await?;

        debug!(rows_affected = result.rows_affected(), "MySQL statement executed");
        Ok(())
    }

    async fn health_check(&mut self, timeout: Duration) -> DbResult<HealthStatus> {
        let pool = self.pool()?;
        let start = Instant::now();

        with_deadline("mysql health check", timeout, async {
            sqlx::query("SELECT 1")
                .execute(pool)
                .await
                .map_err(|e| DbError::health_check_failed_with("MySQL ping failed", e))
        })
        .await?;

        Ok(HealthStatus::healthy(start.elapsed().as_secs_f64() * 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_rejects_bad_ssl_mode() {
        let config = ConnectionConfig::new("localhost", 3306).with_param("ssl_mode", "maybe");
        assert!(connect_options(&config).is_err());
    }

    #[test]
    fn test_connect_options_accepts_known_ssl_mode() {
        let config = ConnectionConfig::new("localhost", 3306)
            .with_database("shop")
            .with_param("ssl_mode", "required");
        assert!(connect_options(&config).is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut adapter = MySqlAdapter::new();
        assert!(adapter.disconnect().await.is_ok());
        assert!(adapter.disconnect().await.is_ok());
        let err = adapter
            .execute_query("SELECT 1", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_CONNECTED");
    }
}

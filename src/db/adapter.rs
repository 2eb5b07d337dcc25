//! Backend adapter contract.
//!
//! Every backend implements [`BackendAdapter`]: five operations against one
//! native session. Adapters hold `Option<handle>`; calling `connect` twice
//! without `disconnect` fails with `AlreadyConnected`, and statements against a
//! missing handle fail with `NotConnected`.
//!
//! Adapters are created through an [`AdapterFactory`]. [`DriverFactory`] is the
//! default and maps each [`BackendType`] to its driver-backed adapter; backends
//! compiled out by cargo feature fail with `ConnectionFailed`.

use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionConfig, ConnectionState, HealthStatus, QueryParam, QueryResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Default timeout for liveness probes.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Open the native session.
    async fn connect(&mut self, config: &ConnectionConfig, timeout: Duration) -> DbResult<()>;

    /// Release the native session. No-op when already disconnected.
    async fn disconnect(&mut self) -> DbResult<()>;

    /// Run a read operation.
    async fn execute_query(
        &mut self,
        query: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> DbResult<QueryResult>;

    /// Run a write or structural operation.
    async fn execute_ddl(&mut self, statement: &str, timeout: Duration) -> DbResult<()>;

    /// Lightweight liveness probe.
    async fn health_check(&mut self, timeout: Duration) -> DbResult<HealthStatus>;
}

/// Creates fresh adapter instances for `create_connection`.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, backend: BackendType) -> DbResult<Box<dyn BackendAdapter>>;
}

/// Factory backed by the real database drivers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverFactory;

impl AdapterFactory for DriverFactory {
    fn create(&self, backend: BackendType) -> DbResult<Box<dyn BackendAdapter>> {
        use super::adapters;

        match backend {
            BackendType::Postgres => Ok(Box::new(adapters::postgres::PostgresAdapter::new())),
            BackendType::MySQL => Ok(Box::new(adapters::mysql::MySqlAdapter::new())),
            #[cfg(feature = "mongodb")]
            BackendType::MongoDB => Ok(Box::new(adapters::mongodb::MongoAdapter::new())),
            #[cfg(feature = "redis")]
            BackendType::Redis => Ok(Box::new(adapters::redis::RedisAdapter::new())),
            #[cfg(feature = "oracle")]
            BackendType::Oracle => Ok(Box::new(adapters::oracle::OracleAdapter::new())),
            #[cfg(feature = "neo4j")]
            BackendType::Neo4j => Ok(Box::new(adapters::neo4j::Neo4jAdapter::new())),
            #[cfg(feature = "cassandra")]
            BackendType::Cassandra => Ok(Box::new(adapters::cassandra::CassandraAdapter::new())),
            #[cfg(feature = "dynamodb")]
            BackendType::DynamoDB => Ok(Box::new(adapters::dynamodb::DynamoAdapter::new())),
            #[allow(unreachable_patterns)]
            other => Err(DbError::connection_failed(format!(
                "{} support is not compiled in; enable the '{}' feature",
                other,
                feature_name(other)
            ))),
        }
    }
}

fn feature_name(backend: BackendType) -> &'static str {
    match backend {
        BackendType::Postgres | BackendType::MySQL => "default",
        BackendType::MongoDB => "mongodb",
        BackendType::Redis => "redis",
        BackendType::Oracle => "oracle",
        BackendType::Neo4j => "neo4j",
        BackendType::Cassandra => "cassandra",
        BackendType::DynamoDB => "dynamodb",
    }
}

/// Run `fut` with a deadline, mapping expiry to `DbError::Timeout`.
pub async fn with_deadline<T, F>(operation: &str, limit: Duration, fut: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DbError::timeout(operation, duration_ms(limit))),
    }
}

/// Milliseconds as `u64`, saturating.
pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Error for statements issued against an adapter with no open session.
pub(crate) fn not_connected() -> DbError {
    DbError::not_connected(ConnectionState::Disconnected)
}

/// Error for a second `connect` without an intervening `disconnect`.
pub(crate) fn already_connected(backend: BackendType) -> DbError {
    DbError::already_connected(format!("{} adapter already holds an open session", backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let result: DbResult<()> = with_deadline("query", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        match result {
            Err(DbError::Timeout {
                operation,
                elapsed_ms,
            }) => {
                assert_eq!(operation, "query");
                assert_eq!(elapsed_ms, 50);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_deadline_passes_through_errors() {
        let result: DbResult<()> = with_deadline("ddl", Duration::from_secs(1), async {
            Err(DbError::query_failed("boom"))
        })
        .await;
        assert_eq!(result.unwrap_err().code(), "QUERY_FAILED");
    }

    #[test]
    fn test_driver_factory_builds_sql_adapters() {
        let factory = DriverFactory;
        assert!(factory.create(BackendType::Postgres).is_ok());
        assert!(factory.create(BackendType::MySQL).is_ok());
    }

    #[tokio::test]
    async fn test_fresh_adapter_rejects_statements() {
        let mut adapter = DriverFactory.create(BackendType::Postgres).unwrap();
        let err = adapter
            .execute_query("SELECT 1", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_CONNECTED");
        // disconnect on a never-connected adapter is a no-op
        assert!(adapter.disconnect().await.is_ok());
    }
}

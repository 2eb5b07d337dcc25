//! Oracle adapter (ODPI-C via the `oracle` crate).
//!
//! The driver is blocking, so every call runs on the blocking pool.
//! Binds are positional (`:1`, `:2`, ...). DDL and DML are committed
//! immediately.

use super::leading_keyword;
use crate::db::adapter::{BackendAdapter, already_connected, not_connected, with_deadline};
use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionConfig, HealthStatus, QueryParam, QueryResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use oracle::sql_type::{OracleType, ToSql};
use oracle::{Connection, SqlValue};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::debug;

/// Error codes reported for bad credentials or locked accounts.
const AUTH_ERROR_CODES: &[&str] = &["ORA-01017", "ORA-28000", "ORA-01005"];

/// Easy Connect string: `//host:port/service`.
pub fn connect_string(config: &ConnectionConfig) -> String {
    let service = config
        .param_str("service_name")
        .or_else(|| config.database.clone());
    match service {
        Some(service) => format!("//{}:{}/{}", config.host, config.port, service),
        None => format!("//{}:{}", config.host, config.port),
    }
}

fn is_read_sql(statement: &str) -> bool {
    matches!(leading_keyword(statement).as_str(), "SELECT" | "WITH")
}

fn param_to_sql(param: &QueryParam) -> Box<dyn ToSql + Send> {
    match param {
        QueryParam::Null => Box::new(Option::<String>::None),
        // No SQL BOOLEAN before 23c
        QueryParam::Bool(b) => Box::new(i64::from(*b)),
        QueryParam::Int(i) => Box::new(*i),
        QueryParam::Float(f) => Box::new(*f),
        QueryParam::String(s) => Box::new(s.clone()),
        QueryParam::Json(v) => Box::new(v.to_string()),
    }
}

fn is_auth_error(err: &oracle::Error) -> bool {
    let message = err.to_string();
    AUTH_ERROR_CODES.iter().any(|code| message.contains(code))
}

fn map_connect_error(err: oracle::Error) -> DbError {
    if is_auth_error(&err) {
        DbError::authentication_failed_with(err.to_string(), err)
    } else {
        DbError::connection_failed_with(format!("Failed to connect to Oracle: {}", err), err)
    }
}

fn map_error(context: &str, err: oracle::Error) -> DbError {
    DbError::query_failed_with(format!("{}: {}", context, err), err)
}

fn map_join_error(err: task::JoinError) -> DbError {
    DbError::query_failed_with(format!("Oracle worker failed: {}", err), err)
}

fn number_json(value: &SqlValue, scale: i8) -> oracle::Result<JsonValue> {
    if scale == 0 {
        if let Ok(i) = value.get::<i64>() {
            return Ok(JsonValue::from(i));
        }
    }
    let f: f64 = value.get()?;
    Ok(serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null))
}

fn sql_value_to_json(value: &SqlValue) -> oracle::Result<JsonValue> {
    if value.is_null()? {
        return Ok(JsonValue::Null);
    }
    let json = match value.oracle_type()? {
        OracleType::Number(_, scale) => number_json(value, *scale)?,
        OracleType::Int64 | OracleType::UInt64 => JsonValue::from(value.get::<i64>()?),
        OracleType::BinaryFloat | OracleType::BinaryDouble | OracleType::Float(_) => {
            number_json(value, -1)?
        }
        OracleType::Boolean => JsonValue::Bool(value.get()?),
        OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => {
            let bytes: Vec<u8> = value.get()?;
            JsonValue::String(STANDARD.encode(bytes))
        }
        // Text, dates, timestamps, intervals and LOB text read as strings
        _ => JsonValue::String(value.get::<String>()?),
    };
    Ok(json)
}

fn run_query(
    conn: &Connection,
    statement: &str,
    params: &[QueryParam],
) -> oracle::Result<(Vec<String>, Vec<Vec<JsonValue>>)> {
    let binds: Vec<Box<dyn ToSql + Send>> = params.iter().map(param_to_sql).collect();
    let refs: Vec<&dyn ToSql> = binds.iter().map(|b| b.as_ref() as &dyn ToSql).collect();

    let result_set = conn.query(statement, &refs)?;
    let columns: Vec<String> = result_set
        .column_info()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let mut rows = Vec::new();
    for row in result_set {
        let row = row?;
        rows.push(
            row.sql_values()
                .iter()
                .map(sql_value_to_json)
                .collect::<oracle::Result<Vec<_>>>()?,
        );
    }
    Ok((columns, rows))
}

#[derive(Default)]
pub struct OracleAdapter {
    conn: Option<Arc<Connection>>,
}

impl OracleAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&self) -> DbResult<Arc<Connection>> {
        self.conn.clone().ok_or_else(not_connected)
    }
}

#[async_trait]
impl BackendAdapter for OracleAdapter {
    async fn connect(&mut self, config: &ConnectionConfig, timeout: Duration) -> DbResult<()> {
        if self.conn.is_some() {
            return Err(already_connected(BackendType::Oracle));
        }

        let user = config.username.clone().unwrap_or_default();
        let password = config.password.clone().unwrap_or_default();
        let target = connect_string(config);

        let conn = with_deadline("oracle connect", timeout, async move {
            task::spawn_blocking(move || Connection::connect(&user, &password, &target))
                .await
                .map_err(map_join_error)?
                .map_err(map_connect_error)
        })
        .await?;

        debug!(host = %config.host, port = config.port, "Oracle session established");
        self.conn = Some(Arc::new(conn));
        Ok(())
    }

    async fn disconnect(&mut self) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        task::spawn_blocking(move || conn.close())
            .await
            .map_err(map_join_error)?
            .map_err(|e| map_error("Oracle close failed", e))
    }

    async fn execute_query(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> DbResult<QueryResult> {
        let conn = self.conn()?;
        if !is_read_sql(statement) {
            return Err(DbError::query_failed(
                "Statement is not a SELECT; use execute_ddl",
            ));
        }

        let start = Instant::now();
        let sql = statement.to_string();
        let params = params.to_vec();
        let (columns, rows) = with_deadline("oracle query", timeout, async move {
            task::spawn_blocking(move || run_query(&conn, &sql, &params))
                .await
                .map_err(map_join_error)?
                .map_err(|e| map_error("Oracle query failed", e))
        })
        .await?;

        Ok(QueryResult::new(columns, rows, start.elapsed()))
    }

    async fn execute_ddl(&mut self, statement: &str, timeout: Duration) -> DbResult<()> {
        let conn = self.conn()?;
        if is_read_sql(statement) {
            return Err(DbError::query_failed(
                "SELECT is a read; use execute_query",
            ));
        }

        let sql = statement.to_string();
        with_deadline("oracle ddl", timeout, async move {
            task::spawn_blocking(move || {
                conn.execute(&sql, &[])?;
                conn.commit()
            })
            .await
            .map_err(map_join_error)?
            .map_err(|e| map_error("Oracle statement failed", e))
        })
        .await?;

        debug!("Oracle statement executed");
        Ok(())
    }

    async fn health_check(&mut self, timeout: Duration) -> DbResult<HealthStatus> {
        let conn = self.conn()?;
        let start = Instant::now();

        with_deadline("oracle health check", timeout, async move {
            task::spawn_blocking(move || conn.ping())
                .await
                .map_err(map_join_error)?
                .map_err(|e| DbError::health_check_failed_with("Oracle ping failed", e))
        })
        .await?;

        Ok(HealthStatus::healthy(start.elapsed().as_secs_f64() * 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_string() {
        let config = ConnectionConfig::new("db.local", 1521).with_database("FREEPDB1");
        assert_eq!(connect_string(&config), "//db.local:1521/FREEPDB1");

        let by_param = ConnectionConfig::new("db.local", 1521)
            .with_database("ignored")
            .with_param("service_name", json!("ORCL"));
        assert_eq!(connect_string(&by_param), "//db.local:1521/ORCL");

        assert_eq!(connect_string(&ConnectionConfig::new("h", 1)), "//h:1");
    }

    #[test]
    fn test_is_read_sql() {
        assert!(is_read_sql("SELECT * FROM dual"));
        assert!(is_read_sql("with t as (select 1 from dual) select * from t"));
        assert!(!is_read_sql("INSERT INTO t VALUES (:1)"));
        assert!(!is_read_sql("BEGIN proc; END;"));
    }
}

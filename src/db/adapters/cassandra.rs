//! Cassandra / ScyllaDB adapter (scylla driver).
//!
//! `?` placeholders are rendered as CQL literals before the statement is sent,
//! so integer params fit `int`, `bigint` and `smallint` columns alike.
//! `?` inside quoted strings is left untouched.

use super::leading_keyword;
use crate::db::adapter::{BackendAdapter, already_connected, not_connected, with_deadline};
use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionConfig, HealthStatus, QueryParam, QueryResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::value::{CqlValue, Row};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// CQL statements that only read.
const READ_KEYWORDS: &[&str] = &["SELECT", "DESCRIBE", "DESC", "LIST"];

pub fn is_read_cql(statement: &str) -> bool {
    READ_KEYWORDS.contains(&leading_keyword(statement).as_str())
}

fn cql_string_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn param_literal(param: &QueryParam) -> String {
    match param {
        QueryParam::Null => "null".to_string(),
        QueryParam::Bool(b) => b.to_string(),
        QueryParam::Int(i) => i.to_string(),
        QueryParam::Float(f) if f.is_finite() => f.to_string(),
        QueryParam::Float(f) if f.is_nan() => "NaN".to_string(),
        QueryParam::Float(f) if *f > 0.0 => "Infinity".to_string(),
        QueryParam::Float(_) => "-Infinity".to_string(),
        QueryParam::String(s) => cql_string_literal(s),
        QueryParam::Json(v) => cql_string_literal(&v.to_string()),
    }
}

/// Replace each unquoted `?` with the next parameter's literal.
pub fn bind_positional(statement: &str, params: &[QueryParam]) -> DbResult<String> {
    let mut out = String::with_capacity(statement.len());
    let mut next = params.iter();
    let mut quote: Option<char> = None;

    for c in statement.chars() {
        match (quote, c) {
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (None, '?') => {
                let param = next.next().ok_or_else(|| {
                    DbError::query_failed(format!(
                        "Statement has more placeholders than the {} supplied parameters",
                        params.len()
                    ))
                })?;
                out.push_str(&param_literal(param));
            }
            _ => out.push(c),
        }
    }

    if next.next().is_some() {
        return Err(DbError::query_failed(format!(
            "{} parameters supplied but the statement uses fewer placeholders",
            params.len()
        )));
    }
    Ok(out)
}

fn cql_to_json(value: &CqlValue) -> JsonValue {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => JsonValue::String(s.clone()),
        CqlValue::Boolean(b) => JsonValue::Bool(*b),
        CqlValue::TinyInt(i) => JsonValue::from(*i),
        CqlValue::SmallInt(i) => JsonValue::from(*i),
        CqlValue::Int(i) => JsonValue::from(*i),
        CqlValue::BigInt(i) => JsonValue::from(*i),
        CqlValue::Counter(c) => JsonValue::from(c.0),
        CqlValue::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        CqlValue::Double(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        CqlValue::Blob(bytes) => JsonValue::String(STANDARD.encode(bytes)),
        CqlValue::Uuid(u) => JsonValue::String(u.to_string()),
        CqlValue::Inet(ip) => JsonValue::String(ip.to_string()),
        // Milliseconds since the epoch
        CqlValue::Timestamp(ts) => JsonValue::from(ts.0),
        CqlValue::List(items) | CqlValue::Set(items) => {
            JsonValue::Array(items.iter().map(cql_to_json).collect())
        }
        CqlValue::Map(pairs) => JsonValue::Array(
            pairs
                .iter()
                .map(|(k, v)| JsonValue::Array(vec![cql_to_json(k), cql_to_json(v)]))
                .collect(),
        ),
        CqlValue::Tuple(items) => JsonValue::Array(
            items
                .iter()
                .map(|v| v.as_ref().map_or(JsonValue::Null, cql_to_json))
                .collect(),
        ),
        CqlValue::Empty => JsonValue::Null,
        other => JsonValue::String(format!("{:?}", other)),
    }
}

fn map_query_error<E>(err: E) -> DbError
where
    E: std::error::Error + Send + Sync + 'static,
{
    DbError::query_failed_with(format!("CQL failed: {}", err), err)
}

#[derive(Default)]
pub struct CassandraAdapter {
    session: Option<Arc<Session>>,
}

impl CassandraAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> DbResult<&Session> {
        self.session.as_deref().ok_or_else(not_connected)
    }
}

#[async_trait]
impl BackendAdapter for CassandraAdapter {
    async fn connect(&mut self, config: &ConnectionConfig, timeout: Duration) -> DbResult<()> {
        if self.session.is_some() {
            return Err(already_connected(BackendType::Cassandra));
        }

        let mut builder = SessionBuilder::new()
            .known_node(format!("{}:{}", config.host, config.port))
            .connection_timeout(timeout);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            builder = builder.user(user, password);
        }
        if let Some(keyspace) = &config.database {
            builder = builder.use_keyspace(keyspace, false);
        }

        let session = with_deadline("cassandra connect", timeout, async {
            builder.build().await.map_err(|e| {
                let message = e.to_string();
                if message.contains("Authentication") || message.contains("authenticat") {
                    DbError::authentication_failed_with(message, e)
                } else {
                    DbError::connection_failed_with(
                        format!("Failed to connect to Cassandra: {}", message),
                        e,
                    )
                }
            })
        })
        .await?;

        debug!(host = %config.host, port = config.port, "Cassandra session established");
        self.session = Some(Arc::new(session));
        Ok(())
    }

    async fn disconnect(&mut self) -> DbResult<()> {
        // Dropping the session closes its connection pools
        self.session = None;
        Ok(())
    }

    async fn execute_query(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> DbResult<QueryResult> {
        let session = self.session()?;
        if !is_read_cql(statement) {
            return Err(DbError::query_failed(
                "CQL statement is not a read; use execute_ddl",
            ));
        }
        let cql = bind_positional(statement, params)?;

        let start = Instant::now();
        let (columns, rows) = with_deadline("cassandra query", timeout, async {
            let result = session
                .query_unpaged(cql, ())
                .await
                .map_err(map_query_error)?;
            let rows_result = result.into_rows_result().map_err(map_query_error)?;
            let columns: Vec<String> = rows_result
                .column_specs()
                .iter()
                .map(|spec| spec.name().to_string())
                .collect();
            let mut rows = Vec::new();
            for row in rows_result.rows::<Row>().map_err(map_query_error)? {
                let row = row.map_err(map_query_error)?;
                rows.push(
                    row.columns
                        .iter()
                        .map(|v| v.as_ref().map_or(JsonValue::Null, cql_to_json))
                        .collect::<Vec<_>>(),
                );
            }
            Ok((columns, rows))
        })
        .await?;

        Ok(QueryResult::new(columns, rows, start.elapsed()))
    }

    async fn execute_ddl(&mut self, statement: &str, timeout: Duration) -> DbResult<()> {
        let session = self.session()?;
        if is_read_cql(statement) {
            return Err(DbError::query_failed(
                "SELECT is a read; use execute_query",
            ));
        }

        with_deadline("cassandra ddl", timeout, async {
            session
                .query_unpaged(statement, ())
                .await
                .map_err(map_query_error)
        })
        .await?;

        debug!("Cassandra statement executed");
        Ok(())
    }

    async fn health_check(&mut self, timeout: Duration) -> DbResult<HealthStatus> {
        let session = self.session()?;
        let start = Instant::now();

        with_deadline("cassandra health check", timeout, async {
            session
                .query_unpaged("SELECT release_version FROM system.local", ())
                .await
                .map_err(|e| DbError::health_check_failed_with("Cassandra ping failed", e))
        })
        .await?;

        Ok(HealthStatus::healthy(start.elapsed().as_secs_f64() * 1000.0))
    }
}

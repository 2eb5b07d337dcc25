//! Redis adapter on a multiplexed async connection.
//!
//! Commands are plain Redis command lines (`HGETALL user:1`, `SET "a key" v`).
//! Double-quoted tokens may contain spaces; positional params are appended as
//! trailing arguments. Results are returned as `(key, value)` rows.

use crate::db::adapter::{BackendAdapter, already_connected, not_connected, with_deadline};
use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionConfig, HealthStatus, QueryParam, QueryResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tracing::debug;

/// Commands that mutate data or server state.
const WRITE_COMMANDS: &[&str] = &[
    "APPEND", "COPY", "DECR", "DECRBY", "DEL", "EXPIRE", "EXPIREAT", "FLUSHALL", "FLUSHDB",
    "GETDEL", "GETEX", "GETSET", "HDEL", "HINCRBY", "HINCRBYFLOAT", "HMSET", "HSET", "HSETNX",
    "INCR", "INCRBY", "INCRBYFLOAT", "LINSERT", "LMOVE", "LPOP", "LPUSH", "LPUSHX", "LREM",
    "LSET", "LTRIM", "MOVE", "MSET", "MSETNX", "PERSIST", "PEXPIRE", "PEXPIREAT", "PSETEX",
    "PUBLISH", "RENAME", "RENAMENX", "RESTORE", "RPOP", "RPOPLPUSH", "RPUSH", "RPUSHX", "SADD",
    "SDIFFSTORE", "SET", "SETEX", "SETNX", "SETRANGE", "SINTERSTORE", "SMOVE", "SPOP", "SREM",
    "SUNIONSTORE", "SWAPDB", "UNLINK", "XADD", "XDEL", "XTRIM", "ZADD", "ZINCRBY", "ZPOPMAX",
    "ZPOPMIN", "ZREM", "ZREMRANGEBYLEX", "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE", "ZUNIONSTORE",
    "ZINTERSTORE", "CONFIG", "SCRIPT", "FUNCTION",
];

/// A parsed Redis command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl RedisCommand {
    /// Parse a command line, appending `params` as trailing arguments.
    pub fn parse(line: &str, params: &[QueryParam]) -> DbResult<Self> {
        let mut tokens = tokenize(line)?;
        if tokens.is_empty() {
            return Err(DbError::query_failed("Empty Redis command"));
        }
        let name = tokens.remove(0).to_uppercase();
        tokens.extend(params.iter().map(QueryParam::to_text));
        Ok(Self { name, args: tokens })
    }

    pub fn is_write(&self) -> bool {
        WRITE_COMMANDS.contains(&self.name.as_str())
    }

    fn to_cmd(&self) -> redis::Cmd {
        let mut cmd = redis::cmd(&self.name);
        for arg in &self.args {
            cmd.arg(arg.as_str());
        }
        cmd
    }
}

/// Split on whitespace, honoring double quotes and backslash escapes inside them.
fn tokenize(line: &str) -> DbResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if in_quotes {
        return Err(DbError::query_failed("Unterminated quote in Redis command"));
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Convert a Redis reply to JSON.
fn value_to_json(value: &redis::Value) -> JsonValue {
    match value {
        redis::Value::Nil => JsonValue::Null,
        redis::Value::Int(n) => JsonValue::from(*n),
        redis::Value::BulkString(data) => {
            JsonValue::String(String::from_utf8_lossy(data).into_owned())
        }
        redis::Value::SimpleString(s) => JsonValue::String(s.clone()),
        redis::Value::Okay => JsonValue::String("OK".to_string()),
        redis::Value::Double(d) => serde_json::Number::from_f64(*d)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(d.to_string())),
        redis::Value::Boolean(b) => JsonValue::Bool(*b),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            JsonValue::Array(items.iter().map(value_to_json).collect())
        }
        redis::Value::Map(pairs) => JsonValue::Array(
            pairs
                .iter()
                .map(|(k, v)| JsonValue::Array(vec![value_to_json(k), value_to_json(v)]))
                .collect(),
        ),
        redis::Value::VerbatimString { text, .. } => JsonValue::String(text.clone()),
        redis::Value::Attribute { data, .. } => value_to_json(data),
        other => JsonValue::String(format!("{:?}", other)),
    }
}

/// Shape a reply as `(key, value)` rows.
///
/// Scalars become one row with a null key, arrays and sets are indexed, maps
/// use their keys. `Nil` yields no rows.
fn reply_to_rows(value: &redis::Value) -> Vec<Vec<JsonValue>> {
    match value {
        redis::Value::Nil => Vec::new(),
        redis::Value::Array(items) | redis::Value::Set(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| vec![JsonValue::from(i), value_to_json(v)])
            .collect(),
        redis::Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| vec![value_to_json(k), value_to_json(v)])
            .collect(),
        redis::Value::Attribute { data, .. } => reply_to_rows(data),
        other => vec![vec![JsonValue::Null, value_to_json(other)]],
    }
}

/// Statement failures are always `QueryFailed`; a dropped session shows in the
/// message and cause, and the next health check moves the entry to reconnect.
fn map_command_error(err: redis::RedisError) -> DbError {
    if err.is_io_error() || err.is_connection_dropped() {
        DbError::query_failed_with(format!("Redis connection lost: {}", err), err)
    } else {
        DbError::query_failed_with(format!("Redis command failed: {}", err), err)
    }
}

fn map_connect_error(err: redis::RedisError) -> DbError {
    if err.kind() == redis::ErrorKind::AuthenticationFailed {
        DbError::authentication_failed_with("Redis rejected the supplied credentials", err)
    } else {
        DbError::connection_failed_with(format!("Failed to connect to Redis: {}", err), err)
    }
}

#[derive(Default)]
pub struct RedisAdapter {
    conn: Option<MultiplexedConnection>,
}

impl RedisAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&mut self) -> DbResult<&mut MultiplexedConnection> {
        self.conn.as_mut().ok_or_else(not_connected)
    }

    async fn run(
        &mut self,
        command: &RedisCommand,
        operation: &str,
        timeout: Duration,
    ) -> DbResult<redis::Value> {
        let conn = self.conn()?;
        let cmd = command.to_cmd();
        with_deadline(operation, timeout, async {
            let reply: redis::Value = cmd.query_async(conn).await.map_err(map_command_error)?;
            Ok(reply)
        })
        .await
    }
}

#[async_trait]
impl BackendAdapter for RedisAdapter {
    async fn connect(&mut self, config: &ConnectionConfig, timeout: Duration) -> DbResult<()> {
        if self.conn.is_some() {
            return Err(already_connected(BackendType::Redis));
        }

        let scheme = if config.param_bool("tls").unwrap_or(false) {
            "rediss"
        } else {
            "redis"
        };
        let url = config.to_url(scheme).map_err(DbError::connection_failed)?;
        let client = redis::Client::open(url.as_str()).map_err(map_connect_error)?;

        let conn = with_deadline("redis connect", timeout, async {
            let mut conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(map_connect_error)?;
            // Authentication errors only surface on the first command
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(map_connect_error)?;
            Ok(conn)
        })
        .await?;

        debug!(host = %config.host, port = config.port, "Redis connection verified with PING");
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> DbResult<()> {
        // The multiplexed driver task ends once the last handle is dropped
        self.conn = None;
        Ok(())
    }

    async fn execute_query(
        &mut self,
        query: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> DbResult<QueryResult> {
        self.conn()?;
        let command = RedisCommand::parse(query, params)?;
        if command.is_write() {
            return Err(DbError::query_failed(format!(
                "{} modifies data; use execute_ddl",
                command.name
            )));
        }

        let start = Instant::now();
        let reply = self.run(&command, "redis query", timeout).await?;
        let rows = reply_to_rows(&reply);

        debug!(command = %command.name, row_count = rows.len(), "Redis query completed");
        Ok(QueryResult::new(
            vec!["key".to_string(), "value".to_string()],
            rows,
            start.elapsed(),
        )
        .with_metadata("command", command.name))
    }

    async fn execute_ddl(&mut self, statement: &str, timeout: Duration) -> DbResult<()> {
        self.conn()?;
        let command = RedisCommand::parse(statement, &[])?;
        if !command.is_write() {
            return Err(DbError::query_failed(format!(
                "{} is a read command; use execute_query",
                command.name
            )));
        }

        let reply = self.run(&command, "redis command", timeout).await?;
        if let redis::Value::ServerError(err) = reply {
            return Err(DbError::query_failed(format!(
                "Redis command failed: {:?}",
                err
            )));
        }
        debug!(command = %command.name, "Redis write completed");
        Ok(())
    }

    async fn health_check(&mut self, timeout: Duration) -> DbResult<HealthStatus> {
        let conn = self.conn()?;
        let start = Instant::now();

        with_deadline("redis health check", timeout, async {
            let _: String = redis::cmd("PING")
                .query_async(conn)
                .await
                .map_err(|e| DbError::health_check_failed_with("Redis PING failed", e))?;
            Ok(())
        })
        .await?;

        Ok(HealthStatus::healthy(start.elapsed().as_secs_f64() * 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_connection_during_command_is_query_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = map_command_error(redis::RedisError::from(io));
        assert_eq!(err.code(), "QUERY_FAILED");
        assert!(err.to_string().contains("Redis connection lost"));
        assert!(err.cause().is_some());
    }

    #[test]
    fn test_tokenize_quotes_and_escapes() {
        let tokens = tokenize(r#"SET "user name" "say \"hi\"""#).unwrap();
        assert_eq!(tokens, vec!["SET", "user name", r#"say "hi""#]);
        assert_eq!(tokenize(r#"GET """#).unwrap(), vec!["GET", ""]);
    }

    #[test]
    fn test_tokenize_unterminated_quote() {
        assert!(tokenize(r#"GET "oops"#).is_err());
    }

    #[test]
    fn test_parse_appends_params() {
        let cmd = RedisCommand::parse(
            "hget user:1",
            &[QueryParam::String("email".into()), QueryParam::Int(3)],
        )
        .unwrap();
        assert_eq!(cmd.name, "HGET");
        assert_eq!(cmd.args, vec!["user:1", "email", "3"]);
        assert!(!cmd.is_write());
    }

    #[test]
    fn test_parse_empty_command() {
        let err = RedisCommand::parse("   ", &[]).unwrap_err();
        assert_eq!(err.code(), "QUERY_FAILED");
    }

    #[test]
    fn test_write_classification() {
        assert!(RedisCommand::parse("set k v", &[]).unwrap().is_write());
        assert!(RedisCommand::parse("DEL k", &[]).unwrap().is_write());
        assert!(!RedisCommand::parse("LRANGE l 0 -1", &[]).unwrap().is_write());
    }

    #[test]
    fn test_reply_to_rows_shapes() {
        let rows = reply_to_rows(&redis::Value::BulkString(b"v1".to_vec()));
        assert_eq!(rows, vec![vec![JsonValue::Null, JsonValue::from("v1")]]);

        let rows = reply_to_rows(&redis::Value::Array(vec![
            redis::Value::Int(1),
            redis::Value::Nil,
        ]));
        assert_eq!(rows[1], vec![JsonValue::from(1), JsonValue::Null]);

        let rows = reply_to_rows(&redis::Value::Map(vec![(
            redis::Value::SimpleString("f".into()),
            redis::Value::Int(9),
        )]));
        assert_eq!(rows, vec![vec![JsonValue::from("f"), JsonValue::from(9)]]);

        assert!(reply_to_rows(&redis::Value::Nil).is_empty());
    }

    #[tokio::test]
    async fn test_write_rejected_by_execute_query_before_io() {
        let mut adapter = RedisAdapter::new();
        // No session: NotConnected takes precedence over command validation
        let err = adapter
            .execute_query("SET a b", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_CONNECTED");
    }
}

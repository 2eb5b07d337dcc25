//! Neo4j adapter speaking Cypher over Bolt (neo4rs).
//!
//! Positional params bind as `$p1`..`$pn`. Result columns come back in
//! lexical order since Bolt records are decoded as maps.

use crate::db::adapter::{BackendAdapter, already_connected, not_connected, with_deadline};
use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionConfig, HealthStatus, QueryParam, QueryResult};
use async_trait::async_trait;
use neo4rs::{BoltList, BoltMap, BoltNull, BoltString, BoltType, ConfigBuilder, Graph, Query, query};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cypher clauses that write to the graph or schema.
const WRITE_CLAUSES: &[&str] = &[
    "CREATE", "MERGE", "DELETE", "DETACH", "SET", "REMOVE", "DROP", "FOREACH", "LOAD",
];

/// True when any token of the statement is a write clause.
pub fn is_write_cypher(statement: &str) -> bool {
    statement
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|token| {
            WRITE_CLAUSES
                .iter()
                .any(|clause| token.eq_ignore_ascii_case(clause))
        })
}

fn json_to_bolt(value: &JsonValue) -> BoltType {
    match value {
        JsonValue::Null => BoltType::Null(BoltNull),
        JsonValue::Bool(b) => BoltType::from(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => BoltType::from(i),
            None => BoltType::from(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => BoltType::from(s.clone()),
        JsonValue::Array(items) => {
            let mut list = BoltList::new();
            for item in items {
                list.push(json_to_bolt(item));
            }
            BoltType::List(list)
        }
        JsonValue::Object(map) => {
            let mut bolt = BoltMap::new();
            for (key, item) in map {
                bolt.put(BoltString::from(key.as_str()), json_to_bolt(item));
            }
            BoltType::Map(bolt)
        }
    }
}

fn param_to_bolt(param: &QueryParam) -> BoltType {
    match param {
        QueryParam::Null => BoltType::Null(BoltNull),
        QueryParam::Bool(b) => BoltType::from(*b),
        QueryParam::Int(i) => BoltType::from(*i),
        QueryParam::Float(f) => BoltType::from(*f),
        QueryParam::String(s) => BoltType::from(s.clone()),
        QueryParam::Json(v) => json_to_bolt(v),
    }
}

/// Build a query binding params as `$p1`..`$pn`.
fn build_query(statement: &str, params: &[QueryParam]) -> Query {
    params
        .iter()
        .enumerate()
        .fold(query(statement), |q, (i, param)| {
            q.param(&format!("p{}", i + 1), param_to_bolt(param))
        })
}

/// Tabulate records; columns are the sorted union of record keys.
fn records_to_rows(records: Vec<Map<String, JsonValue>>) -> (Vec<String>, Vec<Vec<JsonValue>>) {
    let columns: Vec<String> = records
        .iter()
        .flat_map(|r| r.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let rows = records
        .into_iter()
        .map(|mut record| {
            columns
                .iter()
                .map(|c| record.remove(c).unwrap_or(JsonValue::Null))
                .collect()
        })
        .collect();
    (columns, rows)
}

fn map_connect_error(err: neo4rs::Error) -> DbError {
    let message = err.to_string();
    if message.to_ascii_lowercase().contains("authentication") {
        DbError::authentication_failed_with(message, err)
    } else {
        DbError::connection_failed_with(format!("Failed to connect to Neo4j: {}", message), err)
    }
}

#[derive(Default)]
pub struct Neo4jAdapter {
    graph: Option<Graph>,
}

impl Neo4jAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn graph(&self) -> DbResult<&Graph> {
        self.graph.as_ref().ok_or_else(not_connected)
    }
}

#[async_trait]
impl BackendAdapter for Neo4jAdapter {
    async fn connect(&mut self, config: &ConnectionConfig, timeout: Duration) -> DbResult<()> {
        if self.graph.is_some() {
            return Err(already_connected(BackendType::Neo4j));
        }

        let scheme = if config.param_bool("tls").unwrap_or(false) {
            "neo4j+s"
        } else {
            "neo4j"
        };
        let mut builder = ConfigBuilder::default()
            .uri(format!("{}://{}:{}", scheme, config.host, config.port))
            .user(config.username.clone().unwrap_or_else(|| "neo4j".to_string()))
            .password(config.password.clone().unwrap_or_default());
        if let Some(db) = &config.database {
            builder = builder.db(db.as_str());
        }
        if let Some(max) = config.param_u64("max_connections") {
            builder = builder.max_connections(usize::try_from(max).unwrap_or(usize::MAX));
        }
        let neo_config = builder.build().map_err(map_connect_error)?;

        let graph = with_deadline("neo4j connect", timeout, async {
            let graph = Graph::connect(neo_config).await.map_err(map_connect_error)?;
            // Pool connections open lazily; a round-trip surfaces auth failures now
            graph
                .run(query("RETURN 1"))
                .await
                .map_err(map_connect_error)?;
            Ok(graph)
        })
        .await?;

        debug!(host = %config.host, port = config.port, "Neo4j graph connected");
        self.graph = Some(graph);
        Ok(())
    }

    async fn disconnect(&mut self) -> DbResult<()> {
        self.graph = None;
        Ok(())
    }

    async fn execute_query(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> DbResult<QueryResult> {
        let graph = self.graph()?;
        if is_write_cypher(statement) {
            return Err(DbError::query_failed(
                "Cypher statement writes to the graph; use execute_ddl",
            ));
        }

        let start = Instant::now();
        let q = build_query(statement, params);
        let records = with_deadline("neo4j query", timeout, async {
            let mut stream = graph
                .execute(q)
                .await
                .map_err(|e| DbError::query_failed_with(format!("Cypher failed: {}", e), e))?;
            let mut records = Vec::new();
            while let Some(row) = stream
                .next()
                .await
                .map_err(|e| DbError::query_failed_with(format!("Cypher failed: {}", e), e))?
            {
                let record = row.to::<Map<String, JsonValue>>().map_err(|e| {
                    DbError::query_failed_with(format!("Cannot decode Neo4j record: {}", e), e)
                })?;
                records.push(record);
            }
            Ok(records)
        })
        .await?;

        let (columns, rows) = records_to_rows(records);
        Ok(QueryResult::new(columns, rows, start.elapsed()))
    }

    async fn execute_ddl(&mut self, statement: &str, timeout: Duration) -> DbResult<()> {
        let graph = self.graph()?;

        with_deadline("neo4j write", timeout, async {
            graph
                .run(query(statement))
                .await
                .map_err(|e| DbError::query_failed_with(format!("Cypher failed: {}", e), e))
        })
        .await?;

        debug!("Neo4j statement executed");
        Ok(())
    }

    async fn health_check(&mut self, timeout: Duration) -> DbResult<HealthStatus> {
        let graph = self.graph()?;
        let start = Instant::now();

        with_deadline("neo4j health check", timeout, async {
            graph
                .run(query("RETURN 1"))
                .await
                .map_err(|e| DbError::health_check_failed_with("Neo4j ping failed", e))
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
    fn test_is_write_cypher() {
        assert!(is_write_cypher("CREATE (n:User {name: $p1})"));
        assert!(is_write_cypher("match (n) detach delete n"));
        assert!(is_write_cypher("MATCH (n) SET n.seen = true"));
        assert!(!is_write_cypher("MATCH (n:User) RETURN n.created_at"));
        assert!(!is_write_cypher("MATCH (n) WHERE n.offset > 3 RETURN count(n)"));
    }

    #[test]
    fn test_records_to_rows_sorted_union() {
        let mut a = Map::new();
        a.insert("name".into(), json!("ada"));
        a.insert("age".into(), json!(36));
        let mut b = Map::new();
        b.insert("name".into(), json!("bob"));
        let (columns, rows) = records_to_rows(vec![a, b]);
        assert_eq!(columns, vec!["age", "name"]);
        assert_eq!(rows[1], vec![JsonValue::Null, json!("bob")]);
    }

    #[test]
    fn test_json_to_bolt_scalars() {
        assert!(matches!(json_to_bolt(&JsonValue::Null), BoltType::Null(_)));
        assert!(matches!(json_to_bolt(&json!(3)), BoltType::Integer(_)));
        assert!(matches!(json_to_bolt(&json!(3.5)), BoltType::Float(_)));
        assert!(matches!(json_to_bolt(&json!([1, 2])), BoltType::List(_)));
        assert!(matches!(json_to_bolt(&json!({"k": "v"})), BoltType::Map(_)));
    }
}

//! MongoDB adapter.
//!
//! Statements are JSON documents tagged by `"op"`, parsed into [`MongoCommand`]:
//!
//! ```json
//! {"op": "find", "collection": "users", "filter": {"age": {"$gt": "$1"}}, "limit": 10}
//! {"op": "insert_many", "collection": "users", "documents": [{"name": "a"}]}
//! ```
//!
//! Values use MongoDB extended JSON (`{"$oid": "..."}`). A string value that is
//! exactly `$1`..`$n` is replaced by the matching positional parameter.

use crate::db::adapter::{BackendAdapter, already_connected, not_connected, with_deadline};
use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionConfig, HealthStatus, QueryParam, QueryResult};
use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures_util::TryStreamExt;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Database, IndexModel};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;

type JsonDoc = Map<String, JsonValue>;

/// Typed MongoDB operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum MongoCommand {
    Find {
        collection: String,
        #[serde(default)]
        filter: JsonDoc,
        sort: Option<JsonDoc>,
        projection: Option<JsonDoc>,
        limit: Option<i64>,
        skip: Option<u64>,
    },
    Aggregate {
        collection: String,
        pipeline: Vec<JsonDoc>,
    },
    Count {
        collection: String,
        #[serde(default)]
        filter: JsonDoc,
    },
    Distinct {
        collection: String,
        field: String,
        #[serde(default)]
        filter: JsonDoc,
    },
    InsertMany {
        collection: String,
        documents: Vec<JsonDoc>,
    },
    UpdateMany {
        collection: String,
        filter: JsonDoc,
        update: JsonDoc,
    },
    DeleteMany {
        collection: String,
        filter: JsonDoc,
    },
    CreateCollection {
        collection: String,
    },
    DropCollection {
        collection: String,
    },
    CreateIndex {
        collection: String,
        keys: JsonDoc,
        name: Option<String>,
        unique: Option<bool>,
    },
    RunCommand {
        command: JsonDoc,
    },
}

impl MongoCommand {
    /// Parse a command document, substituting `$n` placeholders with `params`.
    pub fn parse(text: &str, params: &[QueryParam]) -> DbResult<Self> {
        let mut value: JsonValue = serde_json::from_str(text)
            .map_err(|e| DbError::query_failed_with("Invalid MongoDB command document", e))?;
        if !params.is_empty() {
            substitute_params(&mut value, params)?;
        }
        serde_json::from_value(value)
            .map_err(|e| DbError::query_failed_with(format!("Invalid MongoDB command: {}", e), e))
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Find { .. } => "find",
            Self::Aggregate { .. } => "aggregate",
            Self::Count { .. } => "count",
            Self::Distinct { .. } => "distinct",
            Self::InsertMany { .. } => "insert_many",
            Self::UpdateMany { .. } => "update_many",
            Self::DeleteMany { .. } => "delete_many",
            Self::CreateCollection { .. } => "create_collection",
            Self::DropCollection { .. } => "drop_collection",
            Self::CreateIndex { .. } => "create_index",
            Self::RunCommand { .. } => "run_command",
        }
    }

    /// True for operations that only read. `run_command` is accepted either way.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Self::Find { .. }
                | Self::Aggregate { .. }
                | Self::Count { .. }
                | Self::Distinct { .. }
                | Self::RunCommand { .. }
        )
    }

    pub fn is_write(&self) -> bool {
        !self.is_read() || matches!(self, Self::RunCommand { .. })
    }
}

fn substitute_params(value: &mut JsonValue, params: &[QueryParam]) -> DbResult<()> {
    match value {
        JsonValue::String(s) => {
            if let Some(index) = s.strip_prefix('$').and_then(|n| n.parse::<usize>().ok()) {
                let param = index
                    .checked_sub(1)
                    .and_then(|i| params.get(i))
                    .ok_or_else(|| {
                        DbError::query_failed(format!(
                            "Placeholder ${} has no matching parameter ({} supplied)",
                            index,
                            params.len()
                        ))
                    })?;
                *value = param.to_json();
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                substitute_params(item, params)?;
            }
        }
        JsonValue::Object(map) => {
            for item in map.values_mut() {
                substitute_params(item, params)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn to_document(map: JsonDoc) -> DbResult<Document> {
    Document::try_from(map).map_err(|e| DbError::query_failed_with("Invalid extended JSON", e))
}

fn to_documents(maps: Vec<JsonDoc>) -> DbResult<Vec<Document>> {
    maps.into_iter().map(to_document).collect()
}

/// Tabulate documents: columns are the union of keys in first-seen order.
fn documents_to_rows(docs: Vec<Document>) -> (Vec<String>, Vec<Vec<JsonValue>>) {
    let mut columns: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for doc in &docs {
        for key in doc.keys() {
            if seen.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
    }

    let rows = docs
        .into_iter()
        .map(|mut doc| {
            columns
                .iter()
                .map(|col| {
                    doc.remove(col)
                        .map(Bson::into_relaxed_extjson)
                        .unwrap_or(JsonValue::Null)
                })
                .collect()
        })
        .collect();
    (columns, rows)
}

fn map_connect_error(context: &str, err: mongodb::error::Error) -> DbError {
    use mongodb::error::ErrorKind;

    if matches!(*err.kind, ErrorKind::Authentication { .. }) {
        DbError::authentication_failed_with("MongoDB rejected the supplied credentials", err)
    } else {
        DbError::connection_failed_with(format!("{}: {}", context, err), err)
    }
}

/// Statement failures are always `QueryFailed`, including a session lost
/// mid-command; the driver error stays attached as the cause.
fn map_statement_error(context: &str, err: mongodb::error::Error) -> DbError {
    DbError::query_failed_with(format!("{}: {}", context, err), err)
}

pub(crate) fn client_uri(config: &ConnectionConfig) -> DbResult<String> {
    let mut url = config
        .to_url("mongodb")
        .map_err(DbError::connection_failed)?;
    // The database is addressed per command; credentials default to the admin db
    url.set_path("/");
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(source) = config.param_str("auth_source") {
            pairs.append_pair("authSource", &source);
        }
        if let Some(set) = config.param_str("replica_set") {
            pairs.append_pair("replicaSet", &set);
        }
        if config.param_bool("tls").unwrap_or(false) {
            pairs.append_pair("tls", "true");
        }
    }
    let mut uri = url.to_string();
    if uri.ends_with('?') {
        uri.pop();
    }
    Ok(uri)
}

struct MongoSession {
    client: Client,
    db: Database,
}

#[derive(Default)]
pub struct MongoAdapter {
    session: Option<MongoSession>,
}

impl MongoAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn db(&self) -> DbResult<&Database> {
        self.session.as_ref().map(|s| &s.db).ok_or_else(not_connected)
    }
}

async fn run_read(db: &Database, command: MongoCommand) -> DbResult<QueryResult> {
    let start = Instant::now();
    let op = command.op_name();
    let err = |e| map_statement_error("MongoDB read failed", e);

    let (columns, rows) = match command {
        MongoCommand::Find {
            collection,
            filter,
            sort,
            projection,
            limit,
            skip,
        } => {
            let coll = db.collection::<Document>(&collection);
            let mut action = coll.find(to_document(filter)?);
            if let Some(sort) = sort {
                action = action.sort(to_document(sort)?);
            }
            if let Some(projection) = projection {
                action = action.projection(to_document(projection)?);
            }
            if let Some(limit) = limit {
                action = action.limit(limit);
            }
            if let Some(skip) = skip {
                action = action.skip(skip);
            }
            let docs: Vec<Document> = action.await.map_err(err)?.try_collect().await.map_err(err)?;
            documents_to_rows(docs)
        }
        MongoCommand::Aggregate {
            collection,
            pipeline,
        } => {
            let coll = db.collection::<Document>(&collection);
            let docs: Vec<Document> = coll
                .aggregate(to_documents(pipeline)?)
                .await
                .map_err(err)?
                .try_collect()
                .await
                .map_err(err)?;
            documents_to_rows(docs)
        }
        MongoCommand::Count { collection, filter } => {
            let coll = db.collection::<Document>(&collection);
            let count = coll
                .count_documents(to_document(filter)?)
                .await
                .map_err(err)?;
            (vec!["count".to_string()], vec![vec![JsonValue::from(count)]])
        }
        MongoCommand::Distinct {
            collection,
            field,
            filter,
        } => {
            let coll = db.collection::<Document>(&collection);
            let values = coll
                .distinct(&field, to_document(filter)?)
                .await
                .map_err(err)?;
            let rows = values
                .into_iter()
                .map(|v| vec![v.into_relaxed_extjson()])
                .collect();
            (vec![field], rows)
        }
        MongoCommand::RunCommand { command } => {
            let reply = db.run_command(to_document(command)?).await.map_err(err)?;
            documents_to_rows(vec![reply])
        }
        other => {
            return Err(DbError::query_failed(format!(
                "{} modifies data; use execute_ddl",
                other.op_name()
            )));
        }
    };

    Ok(QueryResult::new(columns, rows, start.elapsed()).with_metadata("op", op))
}

async fn run_write(db: &Database, command: MongoCommand) -> DbResult<()> {
    let err = |e| map_statement_error("MongoDB write failed", e);

    match command {
        MongoCommand::InsertMany {
            collection,
            documents,
        } => {
            let result = db
                .collection::<Document>(&collection)
                .insert_many(to_documents(documents)?)
                .await
                .map_err(err)?;
            debug!(collection = %collection, inserted = result.inserted_ids.len(), "MongoDB insert_many");
        }
        MongoCommand::UpdateMany {
            collection,
            filter,
            update,
        } => {
            let result = db
                .collection::<Document>(&collection)
                .update_many(to_document(filter)?, to_document(update)?)
                .await
                .map_err(err)?;
            debug!(
                collection = %collection,
                matched = result.matched_count,
                modified = result.modified_count,
                "MongoDB update_many"
            );
        }
        MongoCommand::DeleteMany { collection, filter } => {
            let result = db
                .collection::<Document>(&collection)
                .delete_many(to_document(filter)?)
                .await
                .map_err(err)?;
            debug!(collection = %collection, deleted = result.deleted_count, "MongoDB delete_many");
        }
        MongoCommand::CreateCollection { collection } => {
            db.create_collection(&collection).await.map_err(err)?;
        }
        MongoCommand::DropCollection { collection } => {
            db.collection::<Document>(&collection)
                .drop()
                .await
                .map_err(err)?;
        }
        MongoCommand::CreateIndex {
            collection,
            keys,
            name,
            unique,
        } => {
            let mut options = IndexOptions::default();
            options.name = name;
            options.unique = unique;
            let model = IndexModel::builder()
                .keys(to_document(keys)?)
                .options(options)
                .build();
            db.collection::<Document>(&collection)
                .create_index(model)
                .await
                .map_err(err)?;
        }
        MongoCommand::RunCommand { command } => {
            db.run_command(to_document(command)?).await.map_err(err)?;
        }
        other => {
            return Err(DbError::query_failed(format!(
                "{} is a read operation; use execute_query",
                other.op_name()
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl BackendAdapter for MongoAdapter {
    async fn connect(&mut self, config: &ConnectionConfig, timeout: Duration) -> DbResult<()> {
        if self.session.is_some() {
            return Err(already_connected(BackendType::MongoDB));
        }

        let uri = client_uri(config)?;
        let database = config.database.clone().unwrap_or_else(|| "admin".to_string());

        let session = with_deadline("mongodb connect", timeout, async {
            let mut options = ClientOptions::parse(&uri)
                .await
                .map_err(|e| map_connect_error("Invalid MongoDB options", e))?;
            options.connect_timeout = Some(timeout);
            options.server_selection_timeout = Some(timeout);
            options.app_name = config.param_str("app_name");

            let client = Client::with_options(options)
                .map_err(|e| map_connect_error("Failed to create MongoDB client", e))?;
            let db = client.database(&database);
            // The driver connects lazily; ping forces server selection and auth
            db.run_command(doc! { "ping": 1 })
                .await
                .map_err(|e| map_connect_error("Failed to connect to MongoDB", e))?;
            Ok(MongoSession { client, db })
        })
        .await?;

        debug!(host = %config.host, port = config.port, database = %database, "MongoDB client ready");
        self.session = Some(session);
        Ok(())
    }

    async fn disconnect(&mut self) -> DbResult<()> {
        if let Some(session) = self.session.take() {
            session.client.shutdown().await;
        }
        Ok(())
    }

    async fn execute_query(
        &mut self,
        query: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> DbResult<QueryResult> {
        let db = self.db()?;
        let command = MongoCommand::parse(query, params)?;
        if !command.is_read() {
            return Err(DbError::query_failed(format!(
                "{} modifies data; use execute_ddl",
                command.op_name()
            )));
        }
        with_deadline("mongodb query", timeout, run_read(db, command)).await
    }

    async fn execute_ddl(&mut self, statement: &str, timeout: Duration) -> DbResult<()> {
        let db = self.db()?;
        let command = MongoCommand::parse(statement, &[])?;
        if !command.is_write() {
            return Err(DbError::query_failed(format!(
                "{} is a read operation; use execute_query",
                command.op_name()
            )));
        }
        with_deadline("mongodb write", timeout, run_write(db, command)).await
    }

    async fn health_check(&mut self, timeout: Duration) -> DbResult<HealthStatus> {
        let db = self.db()?;
        let start = Instant::now();

        with_deadline("mongodb health check", timeout, async {
            db.run_command(doc! { "ping": 1 })
                .await
                .map_err(|e| DbError::health_check_failed_with("MongoDB ping failed", e))
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
    fn test_lost_connection_during_statement_is_query_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = map_statement_error("MongoDB read failed", mongodb::error::Error::from(io));
        assert_eq!(err.code(), "QUERY_FAILED");
        assert!(err.to_string().contains("MongoDB read failed"));
        assert!(err.cause().is_some());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = map_connect_error("Failed to connect to MongoDB", mongodb::error::Error::from(io));
        assert_eq!(err.code(), "CONNECTION_FAILED");
    }

    #[test]
    fn test_parse_find_with_defaults() {
        let cmd = MongoCommand::parse(r#"{"op": "find", "collection": "users"}"#, &[]).unwrap();
        match cmd {
            MongoCommand::Find {
                collection,
                filter,
                limit,
                ..
            } => {
                assert_eq!(collection, "users");
                assert!(filter.is_empty());
                assert_eq!(limit, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_substitutes_placeholders() {
        let cmd = MongoCommand::parse(
            r#"{"op": "count", "collection": "users", "filter": {"age": {"$gt": "$1"}, "name": "$2"}}"#,
            &[QueryParam::Int(30), QueryParam::String("ada".into())],
        )
        .unwrap();
        let MongoCommand::Count { filter, .. } = cmd else {
            panic!("expected count");
        };
        assert_eq!(filter.get("age"), Some(&json!({"$gt": 30})));
        assert_eq!(filter.get("name"), Some(&json!("ada")));
    }

    #[test]
    fn test_parse_missing_placeholder_parameter() {
        let err = MongoCommand::parse(
            r#"{"op": "count", "collection": "c", "filter": {"a": "$3"}}"#,
            &[QueryParam::Int(1)],
        )
        .unwrap_err();
        assert_eq!(err.code(), "QUERY_FAILED");
    }

    #[test]
    fn test_parse_rejects_unknown_op() {
        assert!(MongoCommand::parse(r#"{"op": "mapReduce", "collection": "c"}"#, &[]).is_err());
        assert!(MongoCommand::parse("not json", &[]).is_err());
    }

    #[test]
    fn test_read_write_classification() {
        let find = MongoCommand::parse(r#"{"op": "find", "collection": "c"}"#, &[]).unwrap();
        assert!(find.is_read() && !find.is_write());
        let drop =
            MongoCommand::parse(r#"{"op": "drop_collection", "collection": "c"}"#, &[]).unwrap();
        assert!(drop.is_write() && !drop.is_read());
        let run = MongoCommand::parse(r#"{"op": "run_command", "command": {"ping": 1}}"#, &[])
            .unwrap();
        assert!(run.is_read() && run.is_write());
    }

    #[test]
    fn test_documents_to_rows_unions_columns() {
        let docs = vec![doc! { "a": 1, "b": "x" }, doc! { "b": "y", "c": true }];
        let (columns, rows) = documents_to_rows(docs);
        assert_eq!(columns, vec!["a", "b", "c"]);
        assert_eq!(rows[0], vec![json!(1), json!("x"), JsonValue::Null]);
        assert_eq!(rows[1], vec![JsonValue::Null, json!("y"), json!(true)]);
    }

    #[test]
    fn test_extended_json_object_id() {
        let mut map = JsonDoc::new();
        map.insert("_id".into(), json!({"$oid": "65a1b2c3d4e5f60718293a4b"}));
        let doc = to_document(map).unwrap();
        assert!(matches!(doc.get("_id"), Some(Bson::ObjectId(_))));
    }

    #[test]
    fn test_client_uri_keeps_options_and_drops_database() {
        let config = ConnectionConfig::new("mongo.local", 27017)
            .with_database("app")
            .with_credentials("svc", "pw")
            .with_param("auth_source", "admin");
        let uri = client_uri(&config).unwrap();
        assert!(uri.starts_with("mongodb://svc:pw@mongo.local:27017/"));
        assert!(uri.contains("authSource=admin"));
        assert!(!uri.contains("/app"));
    }
}

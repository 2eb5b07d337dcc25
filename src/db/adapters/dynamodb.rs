//! DynamoDB adapter (aws-sdk-dynamodb).
//!
//! Statements are either PartiQL text or a JSON command tagged by `op`:
//!
//! ```json
//! {"op": "scan", "table": "users", "limit": 10}
//! {"op": "get_item", "table": "users", "key": {"id": "u1"}}
//! {"op": "create_table", "table": "users", "partition_key": "id", "partition_key_type": "S"}
//! {"op": "delete_table", "table": "users"}
//! ```
//!
//! The endpoint defaults to `http://host:port` (DynamoDB Local) unless the host
//! is an AWS hostname or an `endpoint_url` param is given.

use super::leading_keyword;
use crate::db::adapter::{BackendAdapter, already_connected, not_connected, with_deadline};
use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionConfig, HealthStatus, QueryParam, QueryResult};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::config::Credentials;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_REGION: &str = "us-east-1";

/// Typed DynamoDB operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum DynamoCommand {
    Scan {
        table: String,
        #[serde(default)]
        limit: Option<i32>,
    },
    GetItem {
        table: String,
        key: Map<String, JsonValue>,
    },
    CreateTable {
        table: String,
        partition_key: String,
        #[serde(default = "default_key_type")]
        partition_key_type: String,
        #[serde(default)]
        sort_key: Option<String>,
        #[serde(default = "default_key_type")]
        sort_key_type: String,
    },
    DeleteTable {
        table: String,
    },
}

fn default_key_type() -> String {
    "S".to_string()
}

impl DynamoCommand {
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Scan { .. } | Self::GetItem { .. })
    }
}

/// A parsed statement: a typed command or raw PartiQL.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamoStatement {
    Command(DynamoCommand),
    PartiQl(String),
}

impl DynamoStatement {
    pub fn parse(text: &str) -> DbResult<Self> {
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            serde_json::from_str(trimmed)
                .map(Self::Command)
                .map_err(|e| DbError::query_failed_with(format!("Invalid DynamoDB command: {}", e), e))
        } else if trimmed.is_empty() {
            Err(DbError::query_failed("Empty DynamoDB statement"))
        } else {
            Ok(Self::PartiQl(trimmed.to_string()))
        }
    }

    pub fn is_read(&self) -> bool {
        match self {
            Self::Command(cmd) => cmd.is_read(),
            Self::PartiQl(sql) => leading_keyword(sql) == "SELECT",
        }
    }
}

pub fn json_to_attribute(value: &JsonValue) -> AttributeValue {
    match value {
        JsonValue::Null => AttributeValue::Null(true),
        JsonValue::Bool(b) => AttributeValue::Bool(*b),
        JsonValue::Number(n) => AttributeValue::N(n.to_string()),
        JsonValue::String(s) => AttributeValue::S(s.clone()),
        JsonValue::Array(items) => AttributeValue::L(items.iter().map(json_to_attribute).collect()),
        JsonValue::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_attribute(v)))
                .collect(),
        ),
    }
}

fn param_to_attribute(param: &QueryParam) -> AttributeValue {
    match param {
        QueryParam::Null => AttributeValue::Null(true),
        QueryParam::Bool(b) => AttributeValue::Bool(*b),
        QueryParam::Int(i) => AttributeValue::N(i.to_string()),
        QueryParam::Float(f) => AttributeValue::N(f.to_string()),
        QueryParam::String(s) => AttributeValue::S(s.clone()),
        QueryParam::Json(v) => json_to_attribute(v),
    }
}

fn number_to_json(n: &str) -> JsonValue {
    n.parse::<i64>()
        .map(JsonValue::from)
        .ok()
        .or_else(|| {
            n.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
        })
        .unwrap_or_else(|| JsonValue::String(n.to_string()))
}

pub fn attribute_to_json(value: &AttributeValue) -> JsonValue {
    match value {
        AttributeValue::S(s) => JsonValue::String(s.clone()),
        AttributeValue::N(n) => number_to_json(n),
        AttributeValue::Bool(b) => JsonValue::Bool(*b),
        AttributeValue::Null(_) => JsonValue::Null,
        AttributeValue::B(blob) => JsonValue::String(STANDARD.encode(blob.as_ref())),
        AttributeValue::L(items) => JsonValue::Array(items.iter().map(attribute_to_json).collect()),
        AttributeValue::M(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attribute_to_json(v)))
                .collect(),
        ),
        AttributeValue::Ss(items) => JsonValue::from(items.clone()),
        AttributeValue::Ns(items) => JsonValue::Array(items.iter().map(|n| number_to_json(n)).collect()),
        AttributeValue::Bs(items) => JsonValue::Array(
            items
                .iter()
                .map(|b: &Blob| JsonValue::String(STANDARD.encode(b.as_ref())))
                .collect(),
        ),
        other => JsonValue::String(format!("{:?}", other)),
    }
}

/// Tabulate items; columns are the sorted union of attribute names.
fn items_to_rows(items: &[HashMap<String, AttributeValue>]) -> (Vec<String>, Vec<Vec<JsonValue>>) {
    let columns: Vec<String> = items
        .iter()
        .flat_map(|item| item.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let rows = items
        .iter()
        .map(|item| {
            columns
                .iter()
                .map(|c| item.get(c).map_or(JsonValue::Null, attribute_to_json))
                .collect()
        })
        .collect();
    (columns, rows)
}

const AUTH_ERROR_CODES: &[&str] = &[
    "UnrecognizedClientException",
    "InvalidSignatureException",
    "MissingAuthenticationTokenException",
];

fn map_sdk_error<E, R>(context: &str, err: SdkError<E, R>) -> DbError
where
    E: std::error::Error + ProvideErrorMetadata + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    let transport = matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_));
    let auth = err
        .as_service_error()
        .and_then(|service| service.code())
        .is_some_and(|code| AUTH_ERROR_CODES.contains(&code));

    if transport {
        DbError::connection_failed_with(message, err)
    } else if auth {
        DbError::authentication_failed_with(message, err)
    } else {
        DbError::query_failed_with(message, err)
    }
}

fn is_aws_host(host: &str) -> bool {
    host.ends_with(".amazonaws.com") || host.ends_with(".amazonaws.com.cn")
}

fn endpoint_url(config: &ConnectionConfig) -> Option<String> {
    if let Some(url) = config.param_str("endpoint_url") {
        return Some(url);
    }
    if is_aws_host(&config.host) {
        None
    } else {
        let scheme = if config.param_bool("tls").unwrap_or(false) {
            "https"
        } else {
            "http"
        };
        Some(format!("{}://{}:{}", scheme, config.host, config.port))
    }
}

fn key_type(name: &str) -> DbResult<ScalarAttributeType> {
    match name {
        "S" | "N" | "B" => Ok(ScalarAttributeType::from(name)),
        other => Err(DbError::query_failed(format!(
            "Unsupported key type '{}'; expected S, N or B",
            other
        ))),
    }
}

fn build_error(err: aws_sdk_dynamodb::error::BuildError) -> DbError {
    DbError::query_failed_with(format!("Invalid table definition: {}", err), err)
}

#[derive(Default)]
pub struct DynamoAdapter {
    client: Option<Client>,
}

impl DynamoAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> DbResult<&Client> {
        self.client.as_ref().ok_or_else(not_connected)
    }

    async fn run_partiql(
        client: &Client,
        statement: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<HashMap<String, AttributeValue>>> {
        let parameters = (!params.is_empty())
            .then(|| params.iter().map(param_to_attribute).collect::<Vec<_>>());
        let output = client
            .execute_statement()
            .statement(statement)
            .set_parameters(parameters)
            .send()
            .await
            .map_err(|e| map_sdk_error("PartiQL failed", e))?;
        Ok(output.items.unwrap_or_default())
    }

    async fn run_command(
        client: &Client,
        command: &DynamoCommand,
    ) -> DbResult<Vec<HashMap<String, AttributeValue>>> {
        match command {
            DynamoCommand::Scan { table, limit } => {
                let output = client
                    .scan()
                    .table_name(table)
                    .set_limit(*limit)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("Scan failed", e))?;
                Ok(output.items.unwrap_or_default())
            }
            DynamoCommand::GetItem { table, key } => {
                let key = key
                    .iter()
                    .map(|(k, v)| (k.clone(), json_to_attribute(v)))
                    .collect();
                let output = client
                    .get_item()
                    .table_name(table)
                    .set_key(Some(key))
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("GetItem failed", e))?;
                Ok(output.item.into_iter().collect())
            }
            DynamoCommand::CreateTable {
                table,
                partition_key,
                partition_key_type,
                sort_key,
                sort_key_type,
            } => {
                let mut request = client
                    .create_table()
                    .table_name(table)
                    .billing_mode(BillingMode::PayPerRequest)
                    .key_schema(
                        KeySchemaElement::builder()
                            .attribute_name(partition_key)
                            .key_type(KeyType::Hash)
                            .build()
                            .map_err(build_error)?,
                    )
                    .attribute_definitions(
                        AttributeDefinition::builder()
                            .attribute_name(partition_key)
                            .attribute_type(key_type(partition_key_type)?)
                            .build()
                            .map_err(build_error)?,
                    );
                if let Some(sort_key) = sort_key {
                    request = request
                        .key_schema(
                            KeySchemaElement::builder()
                                .attribute_name(sort_key)
                                .key_type(KeyType::Range)
                                .build()
                                .map_err(build_error)?,
                        )
                        .attribute_definitions(
                            AttributeDefinition::builder()
                                .attribute_name(sort_key)
                                .attribute_type(key_type(sort_key_type)?)
                                .build()
                                .map_err(build_error)?,
                        );
                }
                request
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("CreateTable failed", e))?;
                Ok(Vec::new())
            }
            DynamoCommand::DeleteTable { table } => {
                client
                    .delete_table()
                    .table_name(table)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("DeleteTable failed", e))?;
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for DynamoAdapter {
    async fn connect(&mut self, config: &ConnectionConfig, timeout: Duration) -> DbResult<()> {
        if self.client.is_some() {
            return Err(already_connected(BackendType::DynamoDB));
        }

        let region = config
            .param_str("region")
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let endpoint = endpoint_url(config);

        let client = with_deadline("dynamodb connect", timeout, async {
            let sdk = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.clone()))
                .load()
                .await;
            let mut builder = aws_sdk_dynamodb::config::Builder::from(&sdk);
            if let Some(url) = &endpoint {
                builder = builder.endpoint_url(url);
            }
            if let (Some(access_key), Some(secret)) = (&config.username, &config.password) {
                builder = builder.credentials_provider(Credentials::new(
                    access_key.clone(),
                    secret.clone(),
                    None,
                    None,
                    "unidb",
                ));
            }
            let client = Client::from_conf(builder.build());

            // The SDK connects lazily; one cheap call verifies endpoint and credentials
            client
                .list_tables()
                .limit(1)
                .send()
                .await
                .map_err(|e| map_sdk_error("Failed to connect to DynamoDB", e))?;
            Ok(client)
        })
        .await?;

        debug!(region = %region, endpoint = ?endpoint, "DynamoDB client ready");
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> DbResult<()> {
        self.client = None;
        Ok(())
    }

    async fn execute_query(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> DbResult<QueryResult> {
        let client = self.client()?;
        let parsed = DynamoStatement::parse(statement)?;
        if !parsed.is_read() {
            return Err(DbError::query_failed(
                "DynamoDB statement is not a read; use execute_ddl",
            ));
        }

        let start = Instant::now();
        let items = with_deadline("dynamodb query", timeout, async {
            match &parsed {
                DynamoStatement::Command(cmd) => {
                    if !params.is_empty() {
                        return Err(DbError::query_failed(
                            "Parameters are only supported for PartiQL statements",
                        ));
                    }
                    Self::run_command(client, cmd).await
                }
                DynamoStatement::PartiQl(sql) => Self::run_partiql(client, sql, params).await,
            }
        })
        .await?;

        let (columns, rows) = items_to_rows(&items);
        Ok(QueryResult::new(columns, rows, start.elapsed()))
    }

    async fn execute_ddl(&mut self, statement: &str, timeout: Duration) -> DbResult<()> {
        let client = self.client()?;
        let parsed = DynamoStatement::parse(statement)?;
        if parsed.is_read() {
            return Err(DbError::query_failed(
                "DynamoDB statement is a read; use execute_query",
            ));
        }

        with_deadline("dynamodb write", timeout, async {
            match &parsed {
                DynamoStatement::Command(cmd) => Self::run_command(client, cmd).await,
                DynamoStatement::PartiQl(sql) => Self::run_partiql(client, sql, &[]).await,
            }
        })
        .await?;

        debug!("DynamoDB statement executed");
        Ok(())
    }

    async fn health_check(&mut self, timeout: Duration) -> DbResult<HealthStatus> {
        let client = self.client()?;
        let start = Instant::now();

        with_deadline("dynamodb health check", timeout, async {
            client
                .list_tables()
                .limit(1)
                .send()
                .await
                .map_err(|e| {
                    DbError::health_check_failed(format!(
                        "DynamoDB ping failed: {}",
                        DisplayErrorContext(&e)
                    ))
                })
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
    fn test_parse_command() {
        let parsed = DynamoStatement::parse(r#"{"op": "scan", "table": "users", "limit": 5}"#).unwrap();
        assert_eq!(
            parsed,
            DynamoStatement::Command(DynamoCommand::Scan {
                table: "users".into(),
                limit: Some(5)
            })
        );
        assert!(parsed.is_read());

        let create = DynamoStatement::parse(
            r#"{"op": "create_table", "table": "t", "partition_key": "id"}"#,
        )
        .unwrap();
        assert!(!create.is_read());
        match create {
            DynamoStatement::Command(DynamoCommand::CreateTable { partition_key_type, sort_key, .. }) => {
                assert_eq!(partition_key_type, "S");
                assert!(sort_key.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_partiql_and_errors() {
        let select = DynamoStatement::parse("SELECT * FROM \"users\" WHERE id = ?").unwrap();
        assert!(select.is_read());
        let insert = DynamoStatement::parse("INSERT INTO \"users\" VALUE {'id': ?}").unwrap();
        assert!(!insert.is_read());
        assert!(DynamoStatement::parse("   ").is_err());
        assert!(DynamoStatement::parse(r#"{"op": "truncate", "table": "t"}"#).is_err());
    }

    #[test]
    fn test_attribute_conversion() {
        let value = json!({"id": "u1", "age": 30, "score": 1.5, "tags": ["a"], "gone": null});
        let attr = json_to_attribute(&value);
        assert_eq!(attribute_to_json(&attr), value);
        assert_eq!(
            attribute_to_json(&AttributeValue::Ss(vec!["x".into(), "y".into()])),
            json!(["x", "y"])
        );
        assert_eq!(attribute_to_json(&AttributeValue::N("12345678901234567890123".into())), json!(1.2345678901234568e22));
    }

    #[test]
    fn test_items_to_rows() {
        let mut a = HashMap::new();
        a.insert("id".to_string(), AttributeValue::S("1".into()));
        a.insert("n".to_string(), AttributeValue::N("2".into()));
        let mut b = HashMap::new();
        b.insert("id".to_string(), AttributeValue::S("2".into()));
        let (columns, rows) = items_to_rows(&[a, b]);
        assert_eq!(columns, vec!["id", "n"]);
        assert_eq!(rows[1], vec![json!("2"), JsonValue::Null]);
    }

    #[test]
    fn test_endpoint_url() {
        let local = ConnectionConfig::new("localhost", 8000);
        assert_eq!(endpoint_url(&local).as_deref(), Some("http://localhost:8000"));

        let aws = ConnectionConfig::new("dynamodb.eu-west-1.amazonaws.com", 443);
        assert_eq!(endpoint_url(&aws), None);

        let explicit = ConnectionConfig::new("ignored", 1)
            .with_param("endpoint_url", json!("http://ddb:4566"));
        assert_eq!(endpoint_url(&explicit).as_deref(), Some("http://ddb:4566"));
    }

    #[test]
    fn test_key_type() {
        assert_eq!(key_type("N").unwrap(), ScalarAttributeType::N);
        assert!(key_type("X").is_err());
    }
}

//! Connection-related data models.
//!
//! This module defines the backend enumeration, the caller-supplied connection
//! configuration, the lifecycle state enum and the read-only snapshots the
//! manager hands out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use url::Url;

/// Supported backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Postgres,
    /// Includes MariaDB
    MySQL,
    MongoDB,
    Redis,
    Oracle,
    Neo4j,
    /// Includes ScyllaDB
    Cassandra,
    DynamoDB,
}

impl BackendType {
    /// All backend types, in declaration order.
    pub const ALL: [BackendType; 8] = [
        Self::Postgres,
        Self::MySQL,
        Self::MongoDB,
        Self::Redis,
        Self::Oracle,
        Self::Neo4j,
        Self::Cassandra,
        Self::DynamoDB,
    ];

    /// Parse backend type from a URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySQL),
            "mongodb" | "mongodb+srv" => Some(Self::MongoDB),
            "redis" | "rediss" => Some(Self::Redis),
            "oracle" => Some(Self::Oracle),
            "neo4j" | "neo4j+s" | "bolt" => Some(Self::Neo4j),
            "cassandra" | "scylla" => Some(Self::Cassandra),
            "dynamodb" => Some(Self::DynamoDB),
            _ => None,
        }
    }

    /// Get the display name for this backend type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::MongoDB => "MongoDB",
            Self::Redis => "Redis",
            Self::Oracle => "Oracle",
            Self::Neo4j => "Neo4j",
            Self::Cassandra => "Cassandra",
            Self::DynamoDB => "DynamoDB",
        }
    }

    /// Get the default port for this backend type.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::MySQL => 3306,
            Self::MongoDB => 27017,
            Self::Redis => 6379,
            Self::Oracle => 1521,
            Self::Neo4j => 7687,
            Self::Cassandra => 9042,
            // DynamoDB Local
            Self::DynamoDB => 8000,
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_scheme(s).ok_or_else(|| format!("Unknown backend type: {}", s))
    }
}

/// Configuration for a single connection.
///
/// Supplied by the caller per connection and never persisted. The manager keeps
/// its own copy, so later changes to the caller's value have no effect.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Contains sensitive data - never log
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Backend-specific options (pool sizes, region, keyspace, TLS flags, ...)
    #[serde(default)]
    pub extra_params: HashMap<String, JsonValue>,
}

impl ConnectionConfig {
    /// Create a configuration for the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the database (schema, keyspace, Redis db index, service name).
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Add a backend-specific parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.extra_params.insert(key.into(), value.into());
        self
    }

    /// Read a parameter as a string, accepting JSON strings, numbers and booleans.
    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.extra_params.get(key)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Read a parameter as an unsigned integer.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        match self.extra_params.get(key)? {
            JsonValue::Number(n) => n.as_u64(),
            JsonValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Read a parameter as a boolean ("true"/"false" strings are accepted).
    pub fn param_bool(&self, key: &str) -> Option<bool> {
        match self.extra_params.get(key)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    /// Build a connection URL for drivers that only accept URLs.
    ///
    /// Credentials are percent-encoded; the result must not be logged.
    pub fn to_url(&self, scheme: &str) -> Result<Url, String> {
        let mut url = Url::parse(&format!("{}://{}:{}", scheme, self.host, self.port))
            .map_err(|e| format!("Invalid host '{}': {}", self.host, e))?;

        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|_| "Cannot set username on this URL".to_string())?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|_| "Cannot set password on this URL".to_string())?;
        }
        if let Some(database) = &self.database {
            url.set_path(database);
        }
        Ok(url)
    }

    /// Display-safe "host:port/database" string.
    pub fn endpoint(&self) -> String {
        match &self.database {
            Some(db) => format!("{}:{}/{}", self.host, self.port, db),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("extra_params", &self.extra_params)
            .finish()
    }
}

/// Lifecycle state of a connection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Check if queries may be issued in this state.
    pub fn accepts_queries(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the health sweep probes entries in this state.
    pub fn is_probed(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }

    /// Check if this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::Error => "Error",
            Self::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Connection information returned by list_connections (no secrets exposed).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub backend_type: BackendType,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check_at: Option<DateTime<Utc>>,
    /// Message of the most recent failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Result of a single adapter liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthStatus {
    pub connected: bool,
    pub ping_time_ms: f64,
}

impl HealthStatus {
    pub fn healthy(ping_time_ms: f64) -> Self {
        Self {
            connected: true,
            ping_time_ms,
        }
    }

    pub fn unhealthy(ping_time_ms: f64) -> Self {
        Self {
            connected: false,
            ping_time_ms,
        }
    }
}

/// Per-connection outcome of a health sweep.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub connected: bool,
    pub ping_time_ms: f64,
    /// State after the sweep applied its transition.
    pub state: ConnectionState,
    /// True when the adapter was busy and the probe was skipped.
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate statistics over the registry.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_connections: usize,
    pub max_connections: usize,
    pub by_type: HashMap<BackendType, usize>,
    pub by_state: HashMap<ConnectionState, usize>,
    /// `total_connections / max_connections`
    pub utilization: f64,
}

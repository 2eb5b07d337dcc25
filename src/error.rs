//! Error types for the connection layer.
//!
//! Every failure surfaced by an adapter or the manager is one of the ten kinds
//! below. Native driver errors are never returned directly; they are wrapped as
//! the `cause` of the matching kind so diagnostics survive the conversion.

use crate::models::ConnectionState;
use std::sync::Arc;
use thiserror::Error;

/// Shared handle to a native driver error.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("Not connected: connection is {state}")]
    NotConnected { state: ConnectionState },

    #[error("Already connected: {message}")]
    AlreadyConnected { message: String },

    #[error("Query failed: {message}")]
    QueryFailed {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Health check failed: {message}")]
    HealthCheckFailed {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("Capacity exceeded: all {max_connections} connection slots are in use")]
    CapacityExceeded { max_connections: usize },

    #[error("Connection '{connection_id}' already exists")]
    DuplicateId { connection_id: String },

    #[error("Connection not found: {connection_id}")]
    NotFound { connection_id: String },
}

impl DbError {
    /// Create a connection error without an underlying driver error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap a driver error raised while establishing a session.
    pub fn connection_failed_with<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ConnectionFailed {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Wrap a driver error that rejected the supplied credentials.
    pub fn authentication_failed_with<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::AuthenticationFailed {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Create a not-connected error for the given state.
    pub fn not_connected(state: ConnectionState) -> Self {
        Self::NotConnected { state }
    }

    /// Create an already-connected error.
    pub fn already_connected(message: impl Into<String>) -> Self {
        Self::AlreadyConnected {
            message: message.into(),
        }
    }

    /// Create a query error without an underlying driver error.
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap a driver error raised while running a statement.
    pub fn query_failed_with<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::QueryFailed {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a health check error without an underlying driver error.
    pub fn health_check_failed(message: impl Into<String>) -> Self {
        Self::HealthCheckFailed {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap a driver error raised by a liveness probe.
    pub fn health_check_failed_with<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::HealthCheckFailed {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Create a capacity error.
    pub fn capacity_exceeded(max_connections: usize) -> Self {
        Self::CapacityExceeded { max_connections }
    }

    /// Create a duplicate id error.
    pub fn duplicate_id(connection_id: impl Into<String>) -> Self {
        Self::DuplicateId {
            connection_id: connection_id.into(),
        }
    }

    /// Create a connection not found error.
    pub fn not_found(connection_id: impl Into<String>) -> Self {
        Self::NotFound {
            connection_id: connection_id.into(),
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            Self::NotConnected { .. } => "NOT_CONNECTED",
            Self::AlreadyConnected { .. } => "ALREADY_CONNECTED",
            Self::QueryFailed { .. } => "QUERY_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::HealthCheckFailed { .. } => "HEALTH_CHECK_FAILED",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::DuplicateId { .. } => "DUPLICATE_ID",
            Self::NotFound { .. } => "NOT_FOUND",
        }
    }

    /// The wrapped native driver error, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::ConnectionFailed { cause, .. }
            | Self::AuthenticationFailed { cause, .. }
            | Self::QueryFailed { cause, .. }
            | Self::HealthCheckFailed { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::Timeout { .. } | Self::HealthCheckFailed { .. }
        )
    }
}

/// Result type alias for connection-layer operations.
pub type DbResult<T> = Result<T, DbError>;

/// SQLSTATE / vendor codes that mean the server rejected the credentials.
const AUTH_ERROR_CODES: &[&str] = &["28000", "28P01", "1045", "1044"];

impl DbError {
    /// Map a sqlx error raised while opening a pool.
    pub fn from_sqlx_connect(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err)
                if db_err
                    .code()
                    .is_some_and(|code| AUTH_ERROR_CODES.contains(&&*code)) =>
            {
                DbError::authentication_failed_with(db_err.message().to_string(), err)
            }
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            sqlx::Error::Configuration(msg) => {
                DbError::connection_failed(format!("Invalid connection options: {}", msg))
            }
            _ => DbError::connection_failed_with(format!("Failed to connect: {}", err), err),
        }
    }

    /// Map a sqlx error raised while running a statement.
    pub fn from_sqlx_query(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let message = match db_err.code() {
                    Some(code) => format!("{} (SQLSTATE: {})", db_err.message(), code),
                    None => db_err.message().to_string(),
                };
                DbError::query_failed_with(message, err)
            }
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            sqlx::Error::PoolClosed => DbError::not_connected(ConnectionState::Disconnected),
            _ => DbError::query_failed_with(err.to_string(), err),
        }
    }
}

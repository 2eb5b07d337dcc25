//! unidb library
//!
//! One lifecycle and API surface for many live connections to heterogeneous
//! database backends (PostgreSQL, MySQL, MongoDB, Redis, Oracle, Neo4j,
//! Cassandra, DynamoDB). The [`db::ConnectionManager`] owns a bounded registry
//! of named connections and supervises their state, health and reconnection.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{ConnectionHandle, ConnectionManager, HealthMonitor, ManagerOptions, ReconnectPolicy};
pub use error::{DbError, DbResult};
pub use models::{BackendType, ConnectionConfig, ConnectionState, QueryParam, QueryResult};

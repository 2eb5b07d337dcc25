//! Data models for the connection layer.
//!
//! This module re-exports all value types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{
    BackendType, ConnectionConfig, ConnectionState, ConnectionSummary, HealthResult,
    HealthStatus, ManagerStats,
};
pub use query::{QueryParam, QueryResult};

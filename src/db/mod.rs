//! Connection layer.
//!
//! This module provides:
//! - The backend adapter contract and the driver-backed adapters
//! - The connection state machine
//! - The reconnection policy
//! - The connection manager and its periodic health monitor

pub mod adapter;
pub mod adapters;
pub mod manager;
pub mod monitor;
pub mod policy;
pub mod state;

pub use adapter::{AdapterFactory, BackendAdapter, DriverFactory, with_deadline};
pub use manager::{ConnectionHandle, ConnectionManager, ManagerOptions};
pub use monitor::HealthMonitor;
pub use policy::ReconnectPolicy;
pub use state::{InvalidTransition, StateEvent, StateMachine};

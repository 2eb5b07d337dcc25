//! Connection lifecycle state machine.
//!
//! Transitions are driven by [`StateEvent`]s. Only the edges below exist; every
//! other (state, event) pair is rejected and leaves the state untouched.
//!
//! ```text
//! Disconnected --Connect-->           Connecting
//! Connecting   --Succeeded-->         Connected
//! Connecting   --Failed-->            Error
//! Connected    --Disconnect-->        Disconnected
//! Connected    --HealthCheckFailed--> Reconnecting
//! Reconnecting --Succeeded-->         Connected
//! Reconnecting --RetriesExhausted-->  Error
//! Error        --Reconnect-->         Connecting
//! (any but Closed) --Close-->         Closed
//! ```

use crate::models::ConnectionState;

/// Event applied to a connection's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Caller asked to open the session
    Connect,
    /// The adapter's connect succeeded
    Succeeded,
    /// The adapter's connect failed
    Failed,
    /// Caller asked to release the session but keep the entry
    Disconnect,
    /// A liveness probe failed or timed out
    HealthCheckFailed,
    /// Explicit restart out of `Error`
    Reconnect,
    /// The reconnect policy gave up
    RetriesExhausted,
    /// Entry is being removed
    Close,
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {event} from {from}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub event: StateEvent,
}

/// Compute the target state for `event` applied in `from`.
pub fn next_state(
    from: ConnectionState,
    event: StateEvent,
) -> Result<ConnectionState, InvalidTransition> {
    use ConnectionState as S;
    use StateEvent as E;

    let to = match (from, event) {
        (S::Closed, _) => None,
        (_, E::Close) => Some(S::Closed),
        (S::Disconnected, E::Connect) => Some(S::Connecting),
        (S::Connecting, E::Succeeded) => Some(S::Connected),
        (S::Connecting, E::Failed) => Some(S::Error),
        (S::Connected, E::Disconnect) => Some(S::Disconnected),
        (S::Connected, E::HealthCheckFailed) => Some(S::Reconnecting),
        (S::Reconnecting, E::Succeeded) => Some(S::Connected),
        (S::Reconnecting, E::RetriesExhausted) => Some(S::Error),
        (S::Error, E::Reconnect) => Some(S::Connecting),
        _ => None,
    };
    to.ok_or(InvalidTransition { from, event })
}

/// Authoritative state holder for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachine {
    state: ConnectionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in `Disconnected`.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply an event, returning the new state.
    pub fn apply(&mut self, event: StateEvent) -> Result<ConnectionState, InvalidTransition> {
        let to = next_state(self.state, event)?;
        self.state = to;
        Ok(to)
    }
}

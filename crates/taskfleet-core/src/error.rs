//! Core domain errors.

use thiserror::Error;

use crate::status::ConnectionState;

/// Core domain errors for TaskFleet.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid connection state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Inbound message is not a task request.
    #[error("Not a task request: {0}")]
    NotATaskRequest(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

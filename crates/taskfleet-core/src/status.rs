//! State enums for the coordinator session and the agent model tier.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle of the worker's coordinator session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Transport is being established.
    #[default]
    Connecting,
    /// JOIN sent, waiting for JOIN_ACK.
    Joining,
    /// Accepted by the coordinator and serving requests.
    Active,
    /// Draining the agent supervisor before closing.
    ShuttingDown,
    /// Transport closed.
    Closed,
}

impl ConnectionState {
    /// Returns true if moving from `self` to `next` is a legal transition.
    ///
    /// Every live state may drop straight to shutting down (signal or
    /// transport loss), and shutting down is the only way to close.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Joining)
                | (Joining, Active)
                | (Connecting | Joining | Active, ShuttingDown)
                | (ShuttingDown, Closed)
        )
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), CoreError> {
        if !self.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    /// Returns true once shutdown has started.
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Joining => write!(f, "JOINING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Model tier the agent session runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Whatever model the agent backend picks by default.
    #[default]
    Default,
    /// The stronger, more expensive model.
    Elevated,
}

impl ModelTier {
    /// Model alias to pass to the backend, if the tier overrides the default.
    pub fn model_alias(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::Elevated => Some("opus"),
        }
    }
}

//! Wire messages exchanged between a worker and its coordinator.
//!
//! Every message is a JSON object `{"type": ..., "msg": ..., "req_id": ...}`.
//! `req_id` is only present on request/acknowledgment pairs.

use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, WorkerId};

/// A coordinator protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Worker announces itself; `msg` is the worker identity.
    Join { msg: String },

    /// Coordinator accepts the worker.
    JoinAck {
        #[serde(default)]
        msg: String,
    },

    /// Coordinator asks the worker to run a task; `msg` is the prompt.
    Request {
        #[serde(default)]
        msg: String,
        req_id: RequestId,
    },

    /// Worker accepts a task request.
    RequestAck {
        #[serde(default)]
        msg: String,
        req_id: RequestId,
    },

    /// Coordinator health check.
    Check {
        #[serde(default)]
        msg: String,
        req_id: RequestId,
    },

    /// Worker answers a health check.
    CheckAck {
        #[serde(default)]
        msg: String,
        req_id: RequestId,
    },

    /// Task finished; `msg` is the task file name.
    Done { msg: String },

    /// Task failed; `msg` is the task file name.
    Failed { msg: String },

    /// Agent backend ran out of quota; `msg` is the worker identity.
    UsageLimited { msg: String },

    /// Worker leaves the fleet.
    Leave {
        #[serde(default)]
        msg: String,
    },

    /// Coordinator tells the worker to disconnect.
    Disconnect {
        #[serde(default)]
        msg: String,
    },

    /// Any type this worker does not understand.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Build the JOIN announcement.
    pub fn join(worker_id: &WorkerId) -> Self {
        Self::Join {
            msg: worker_id.as_str().to_string(),
        }
    }

    /// Build a REQUEST_ACK echoing `req_id`.
    pub fn request_ack(req_id: RequestId) -> Self {
        Self::RequestAck {
            msg: String::new(),
            req_id,
        }
    }

    /// Build a CHECK_ACK echoing `req_id`.
    pub fn check_ack(req_id: RequestId) -> Self {
        Self::CheckAck {
            msg: String::new(),
            req_id,
        }
    }

    /// Build the LEAVE notice.
    pub fn leave() -> Self {
        Self::Leave { msg: String::new() }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "JOIN",
            Self::JoinAck { .. } => "JOIN_ACK",
            Self::Request { .. } => "REQUEST",
            Self::RequestAck { .. } => "REQUEST_ACK",
            Self::Check { .. } => "CHECK",
            Self::CheckAck { .. } => "CHECK_ACK",
            Self::Done { .. } => "DONE",
            Self::Failed { .. } => "FAILED",
            Self::UsageLimited { .. } => "USAGE_LIMITED",
            Self::Leave { .. } => "LEAVE",
            Self::Disconnect { .. } => "DISCONNECT",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Request id carried by this message, if any.
    pub fn req_id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { req_id, .. }
            | Self::RequestAck { req_id, .. }
            | Self::Check { req_id, .. }
            | Self::CheckAck { req_id, .. } => Some(req_id),
            _ => None,
        }
    }

    /// Serialize as a single newline-terminated frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }
}

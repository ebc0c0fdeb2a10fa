//! The turn-based contract between a supervisor and its agent process.
//!
//! A backend runs one turn at a time: a prompt goes in, a stream of
//! [`ClaudeMessage`]s comes out, and the turn ends at the terminal
//! `result` message.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SdkError;
use crate::process::KillHandle;
use crate::types::ClaudeMessage;

/// Receives every message the agent emits during a turn.
pub trait TurnObserver: Send + Sync {
    fn on_message(&self, message: &ClaudeMessage);
}

/// An observer that ignores everything.
pub struct NullObserver;

impl TurnObserver for NullObserver {
    fn on_message(&self, _message: &ClaudeMessage) {}
}

/// One prompt submitted to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub prompt: String,
    /// Continue the existing conversation instead of starting one.
    pub continuation: bool,
    /// Conversation to continue, once the agent has reported one.
    pub session_id: Option<String>,
}

impl TurnRequest {
    /// Session id to put on the wire; only sent under continuation.
    pub fn wire_session_id(&self) -> Option<String> {
        if self.continuation {
            self.session_id.clone()
        } else {
            None
        }
    }
}

/// Terminal state of a turn as reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnResult {
    pub session_id: Option<String>,
    pub subtype: Option<String>,
    pub is_error: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl TurnResult {
    /// Returns true if the agent reported quota or usage exhaustion.
    pub fn is_usage_limited(&self) -> bool {
        [self.result.as_deref(), self.error.as_deref()]
            .into_iter()
            .flatten()
            .any(mentions_usage_limit)
    }
}

fn mentions_usage_limit(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("usage limit") || lower.contains("limit reached")
}

/// Classification of a finished turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent completed normally.
    Completed,
    /// The backend ran out of quota.
    UsageLimited,
    /// Any other error, crash or malformed terminal state.
    Failed(String),
}

impl TurnOutcome {
    pub fn classify(result: &Result<TurnResult, SdkError>) -> Self {
        match result {
            Ok(turn) if turn.is_usage_limited() => Self::UsageLimited,
            Ok(turn) if turn.is_error => Self::Failed(
                turn.error
                    .clone()
                    .or_else(|| turn.result.clone())
                    .unwrap_or_else(|| "agent reported an error".to_string()),
            ),
            Ok(turn) => match turn.subtype.as_deref() {
                None | Some("success") => Self::Completed,
                Some(other) => Self::Failed(format!("agent ended with '{}'", other)),
            },
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// A long-lived agent process driven one turn at a time.
#[async_trait]
pub trait AgentBackend: Send {
    /// Spawn the agent process. No-op if it is already running.
    async fn start(&mut self) -> Result<(), SdkError>;

    /// Returns true while a process is attached.
    fn is_running(&self) -> bool;

    /// Submit `request` and stream messages to `observer` until the turn ends.
    async fn turn(
        &mut self,
        request: TurnRequest,
        observer: &dyn TurnObserver,
    ) -> Result<TurnResult, SdkError>;

    /// Handle that terminates the process immediately, from any task.
    fn kill_handle(&self) -> KillHandle;

    /// Close the process, killing it if it has not exited within `grace`.
    async fn shutdown(&mut self, grace: Duration);
}

//! Error types for the Claude Code SDK.

use thiserror::Error;

/// Errors that can occur while driving a Claude Code session.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Claude CLI executable not found.
    #[error("Claude CLI not found at '{0}'. Ensure Claude Code is installed.")]
    ClaudeNotFound(String),

    /// Failed to spawn the Claude process.
    #[error("Failed to spawn Claude process: {0}")]
    SpawnError(std::io::Error),

    /// I/O failure on the process pipes.
    #[error("Claude process I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session has no running process.
    #[error("Claude process is not running")]
    NotRunning,

    /// Claude closed its output before finishing the turn.
    #[error("Claude process exited mid-turn")]
    ProcessExited,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Protocol error during communication.
    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl SdkError {
    /// Returns true if the process is gone and must be respawned.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ProcessExited | Self::NotRunning | Self::SpawnError(_)
        )
    }
}

//! Worker error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use taskfleet_claude_sdk::{PreflightError, SdkError};
use taskfleet_core::CoreError;

/// Errors that stop the worker before or while joining the fleet.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The agent backend failed its startup checks.
    #[error(transparent)]
    Preflight(#[from] PreflightError),

    /// The root directory does not exist or cannot be resolved.
    #[error("Invalid root directory '{path}': {source}")]
    RootDir { path: PathBuf, source: io::Error },

    /// The coordinator could not be reached.
    #[error("Failed to connect to coordinator at {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    /// The coordinator did not accept the JOIN.
    #[error("Handshake with coordinator failed: {0}")]
    Handshake(String),

    /// The coordinator session broke.
    #[error("Coordinator transport error: {0}")]
    Transport(#[from] io::Error),

    /// Termination signal handlers could not be installed.
    #[error("Failed to install signal handler: {0}")]
    Signal(io::Error),

    /// The agent process could not be started.
    #[error("Agent error: {0}")]
    Agent(#[from] SdkError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

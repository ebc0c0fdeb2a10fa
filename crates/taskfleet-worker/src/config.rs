//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use taskfleet_core::ModelTier;

/// Default coordinator port.
pub const DEFAULT_PORT: u16 = 34567;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordinator host.
    pub host: String,

    /// Coordinator port.
    pub port: u16,

    /// Directory the agent process works in.
    pub root_dir: PathBuf,

    /// Model tier for the agent session.
    pub model_tier: ModelTier,

    /// Path to the Claude CLI executable.
    pub claude_path: String,

    /// Wait between protocol loop passes.
    pub poll_interval: Duration,

    /// Wait between passes right after a task request.
    pub fast_poll_interval: Duration,

    /// How long the fast interval stays in effect.
    pub fast_poll_window: Duration,

    /// Upper bound on waiting for the agent supervisor during shutdown.
    pub shutdown_grace: Duration,

    /// Upper bound on the context-clear turn after each task.
    pub clear_timeout: Duration,
}

impl Config {
    /// `host:port` of the coordinator.
    pub fn coordinator_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            root_dir: PathBuf::from("."),
            model_tier: ModelTier::Default,
            claude_path: "claude".to_string(),
            poll_interval: Duration::from_millis(100),
            fast_poll_interval: Duration::from_millis(5),
            fast_poll_window: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(30),
            clear_timeout: Duration::from_secs(60),
        }
    }
}

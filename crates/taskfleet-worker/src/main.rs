//! TaskFleet Worker
//!
//! Joins a coordinator over TCP, runs the tasks it assigns through a
//! Claude Code agent session, and reports each outcome back.

mod bus;
mod config;
mod connection;
mod error;
mod json_output;
mod protocol;
mod shutdown;
mod signals;
mod supervisor;
#[cfg(test)]
mod testing;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskfleet_core::ModelTier;

use config::{Config, DEFAULT_PORT};
use error::WorkerError;

/// TaskFleet worker node.
#[derive(Parser, Debug)]
#[command(name = "taskfleet-worker", about = "Run coordinator tasks with a Claude Code agent")]
struct Args {
    /// Coordinator host
    #[arg(default_value = "localhost")]
    host: String,

    /// Coordinator port
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory the agent works in (defaults to the current directory)
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Run the agent on the elevated model tier
    #[arg(long)]
    elevated: bool,

    /// Path to the Claude CLI executable
    #[arg(long, default_value = "claude")]
    claude_path: String,

    /// Protocol loop poll interval in milliseconds
    #[arg(long, default_value = "100")]
    poll_interval_ms: u64,

    /// Poll interval right after a task request, in milliseconds
    #[arg(long, default_value = "5")]
    fast_poll_interval_ms: u64,

    /// How long the fast poll interval lasts, in seconds
    #[arg(long, default_value = "3")]
    fast_poll_window_secs: u64,

    /// Seconds to wait for the agent during graceful shutdown
    #[arg(long, default_value = "30")]
    shutdown_grace_secs: u64,

    /// Seconds allowed for the context clear after each task
    #[arg(long, default_value = "60")]
    clear_timeout_secs: u64,

    /// Emit machine-readable JSON events on stdout
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<Config, WorkerError> {
        let root_dir = self.root_dir.unwrap_or_else(|| PathBuf::from("."));
        let root_dir = root_dir
            .canonicalize()
            .map_err(|source| WorkerError::RootDir {
                path: root_dir.clone(),
                source,
            })?;

        Ok(Config {
            host: self.host,
            port: self.port,
            root_dir,
            model_tier: if self.elevated {
                ModelTier::Elevated
            } else {
                ModelTier::Default
            },
            claude_path: self.claude_path,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            fast_poll_interval: Duration::from_millis(self.fast_poll_interval_ms),
            fast_poll_window: Duration::from_secs(self.fast_poll_window_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            clear_timeout: Duration::from_secs(self.clear_timeout_secs),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if args.json {
        json_output::enable_json_mode();
    }

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => return fail(e),
    };

    info!(
        coordinator = %config.coordinator_addr(),
        root_dir = %config.root_dir.display(),
        model_tier = ?config.model_tier,
        "Starting TaskFleet worker"
    );

    match worker::run(config).await {
        Ok(outcome) => {
            info!(outcome = ?outcome, "Worker exited");
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

fn fail(e: WorkerError) -> ExitCode {
    error!(error = %e, "Worker failed");
    json_output::emit_error(&e.to_string());
    ExitCode::FAILURE
}

//! Shutdown coordinator.
//!
//! Takes over from the protocol loop once it has left ACTIVE. The
//! graceful path stops the agent supervisor, reports what it finished,
//! and closes the session. A further termination signal while waiting
//! kills the agent process and returns at once.

use std::fmt;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::json_output;
use crate::protocol::ProtocolLoop;
use crate::signals::{next_signal, SignalCount};
use crate::supervisor::SupervisorHandle;

/// Time allowed for the supervisor to notice a kill before it is abandoned.
const KILL_SETTLE: Duration = Duration::from_secs(2);

/// What moved the worker out of ACTIVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// The coordinator sent DISCONNECT or closed the connection.
    Disconnect,
    /// A send or read on the coordinator session failed.
    TransportLost,
    /// SIGINT or SIGTERM.
    Signal,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnect => write!(f, "coordinator disconnect"),
            Self::TransportLost => write!(f, "transport lost"),
            Self::Signal => write!(f, "termination signal"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownPhase {
    #[default]
    Normal,
    Graceful,
    Terminated,
}

/// How the worker ended. Every variant exits with code 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The supervisor stopped on its own.
    Graceful,
    /// The supervisor outlived the grace period and was killed.
    TimedOut,
    /// A second signal cut the shutdown short.
    Forced,
}

pub struct ShutdownCoordinator {
    phase: ShutdownPhase,
    grace: Duration,
    signals: SignalCount,
}

impl ShutdownCoordinator {
    pub fn new(signals: SignalCount, grace: Duration) -> Self {
        Self {
            phase: ShutdownPhase::Normal,
            grace,
            signals,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    /// Drive the worker from SHUTTING_DOWN to exit.
    pub async fn run(
        &mut self,
        trigger: ShutdownTrigger,
        protocol: &mut ProtocolLoop,
        supervisor: SupervisorHandle,
    ) -> ShutdownOutcome {
        self.phase = ShutdownPhase::Graceful;
        let baseline = protocol.signals_seen();
        info!(
            trigger = %trigger,
            grace_secs = self.grace.as_secs(),
            "Graceful shutdown started"
        );

        protocol.request_supervisor_exit();

        let (mut join, kill) = supervisor.into_parts();
        let stopped = tokio::select! {
            result = &mut join => {
                if let Err(e) = result {
                    error!(error = %e, "Agent supervisor task failed");
                }
                true
            }
            _ = signal_beyond(&mut self.signals, baseline) => {
                warn!("Second termination signal, killing agent process");
                kill.kill();
                join.abort();
                self.phase = ShutdownPhase::Terminated;
                json_output::emit_worker_left(
                    Some(protocol.worker_id().as_str()),
                    &trigger.to_string(),
                    true,
                );
                return ShutdownOutcome::Forced;
            }
            _ = tokio::time::sleep(self.grace) => false,
        };

        if !stopped {
            warn!(
                grace_secs = self.grace.as_secs(),
                "Agent supervisor did not stop in time, killing agent process"
            );
            kill.kill();
            if tokio::time::timeout(KILL_SETTLE, &mut join).await.is_err() {
                join.abort();
            }
        }

        protocol.flush_completions().await;
        if trigger == ShutdownTrigger::Signal {
            protocol.leave().await;
        }
        protocol.close().await;

        self.phase = ShutdownPhase::Terminated;
        json_output::emit_worker_left(
            Some(protocol.worker_id().as_str()),
            &trigger.to_string(),
            !stopped,
        );
        info!(worker_id = %protocol.worker_id(), "Worker shut down");

        if stopped {
            ShutdownOutcome::Graceful
        } else {
            ShutdownOutcome::TimedOut
        }
    }
}

/// Resolve once more than `baseline` signals have been counted.
async fn signal_beyond(signals: &mut SignalCount, baseline: usize) {
    loop {
        if *signals.borrow_and_update() > baseline {
            return;
        }
        next_signal(signals).await;
    }
}

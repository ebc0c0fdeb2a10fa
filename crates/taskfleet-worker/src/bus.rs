//! Mailboxes between the protocol loop and the agent supervisor.
//!
//! Both directions are bounded FIFO channels. The loop side never waits:
//! it forwards with `try_send` and drains completions with `try_recv`.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use taskfleet_core::{CompletionEvent, TaskAssignment};

/// Default capacity of each mailbox.
///
/// The loop keeps at most one task in flight, so this only has to hold
/// that task plus an exit instruction.
pub const BUS_CAPACITY: usize = 8;

/// Instruction from the protocol loop to the agent supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    Run(TaskAssignment),
    Exit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("agent supervisor mailbox is full")]
    Full,
    #[error("agent supervisor has stopped")]
    Closed,
}

impl<T> From<TrySendError<T>> for BusError {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Self::Full,
            TrySendError::Closed(_) => Self::Closed,
        }
    }
}

/// Create a connected pair of endpoints.
pub fn channel(capacity: usize) -> (LoopEndpoint, SupervisorEndpoint) {
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (completion_tx, completion_rx) = mpsc::channel(capacity);
    (
        LoopEndpoint {
            commands: command_tx,
            completions: completion_rx,
        },
        SupervisorEndpoint {
            commands: command_rx,
            completions: completion_tx,
        },
    )
}

/// The protocol loop's end of the bus.
#[derive(Debug)]
pub struct LoopEndpoint {
    commands: mpsc::Sender<SupervisorCommand>,
    completions: mpsc::Receiver<CompletionEvent>,
}

impl LoopEndpoint {
    /// Hand a task to the supervisor without waiting.
    pub fn forward(&self, task: TaskAssignment) -> Result<(), BusError> {
        self.commands
            .try_send(SupervisorCommand::Run(task))
            .map_err(BusError::from)
    }

    /// Ask the supervisor to stop once its current step is done.
    pub fn request_exit(&self) -> Result<(), BusError> {
        self.commands
            .try_send(SupervisorCommand::Exit)
            .map_err(BusError::from)
    }

    /// Take every completion that is available right now.
    pub fn drain(&mut self) -> Vec<CompletionEvent> {
        let mut events = Vec::new();
        loop {
            match self.completions.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    /// Wait for the next completion. `None` once the supervisor is gone.
    #[cfg(test)]
    pub async fn recv(&mut self) -> Option<CompletionEvent> {
        self.completions.recv().await
    }
}

/// The agent supervisor's end of the bus.
#[derive(Debug)]
pub struct SupervisorEndpoint {
    commands: mpsc::Receiver<SupervisorCommand>,
    completions: mpsc::Sender<CompletionEvent>,
}

impl SupervisorEndpoint {
    /// Wait for the next instruction. `None` once the loop is gone.
    pub async fn next_command(&mut self) -> Option<SupervisorCommand> {
        self.commands.recv().await
    }

    /// Take every instruction that is waiting right now.
    pub fn take_waiting(&mut self) -> Vec<SupervisorCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            commands.push(command);
        }
        commands
    }

    /// Publish a completion. Returns false if the loop is gone.
    pub async fn publish(&self, event: CompletionEvent) -> bool {
        self.completions.send(event).await.is_ok()
    }
}

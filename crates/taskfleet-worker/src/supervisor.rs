//! Agent supervisor: runs tasks on the long-lived agent process.
//!
//! The supervisor is its own tokio task. It takes instructions from the
//! bus, runs one turn per task, publishes exactly one completion per task
//! and clears the agent's context before it looks at the next instruction.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use taskfleet_claude_sdk::{
    AgentBackend, ClaudeMessage, KillHandle, NullObserver, SdkError, TurnObserver, TurnOutcome,
    TurnRequest, TurnResult,
};
use taskfleet_core::{CompletionEvent, CompletionKind, ModelTier, RequestId, TaskAssignment};

use crate::bus::{SupervisorCommand, SupervisorEndpoint};
use crate::json_output;

/// Prompt that resets the agent's conversation.
pub const CLEAR_COMMAND: &str = "/clear";

/// Conversation state of the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSession {
    active: bool,
    turn_count: u64,
    model_tier: ModelTier,
    session_id: Option<String>,
}

impl AgentSession {
    pub fn new(model_tier: ModelTier) -> Self {
        Self {
            active: false,
            turn_count: 0,
            model_tier,
            session_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn model_tier(&self) -> ModelTier {
        self.model_tier
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// False only for the first turn of an agent process.
    pub fn continuation(&self) -> bool {
        self.turn_count > 0
    }

    pub fn request(&self, prompt: impl Into<String>) -> TurnRequest {
        TurnRequest {
            prompt: prompt.into(),
            continuation: self.continuation(),
            session_id: self.session_id.clone(),
        }
    }

    /// Account for a submitted turn, whatever its result.
    pub fn record(&mut self, result: &Result<TurnResult, SdkError>) {
        self.turn_count += 1;
        if let Ok(TurnResult {
            session_id: Some(id),
            ..
        }) = result
        {
            self.session_id = Some(id.clone());
        }
    }

    /// A fresh agent process starts a fresh conversation.
    fn activate(&mut self) {
        self.active = true;
        self.turn_count = 0;
        self.session_id = None;
    }

    fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Running supervisor, as seen by the shutdown coordinator.
pub struct SupervisorHandle {
    join: JoinHandle<AgentSession>,
    kill: KillHandle,
}

impl SupervisorHandle {
    /// Kill the agent process now, whatever it is doing.
    pub fn force_kill(&self) {
        self.kill.kill();
    }

    pub fn into_parts(self) -> (JoinHandle<AgentSession>, KillHandle) {
        (self.join, self.kill)
    }
}

enum Flow {
    Continue,
    Exit,
}

pub struct AgentSupervisor<B> {
    backend: B,
    session: AgentSession,
    bus: SupervisorEndpoint,
    kill: KillHandle,
    deferred: VecDeque<TaskAssignment>,
    clear_timeout: Duration,
    shutdown_grace: Duration,
}

impl<B: AgentBackend + 'static> AgentSupervisor<B> {
    pub fn new(
        backend: B,
        model_tier: ModelTier,
        bus: SupervisorEndpoint,
        clear_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        let kill = backend.kill_handle();
        Self {
            backend,
            session: AgentSession::new(model_tier),
            bus,
            kill,
            deferred: VecDeque::new(),
            clear_timeout,
            shutdown_grace,
        }
    }

    /// Start the agent process and spawn the supervision loop.
    pub async fn start(mut self) -> Result<SupervisorHandle, SdkError> {
        self.backend.start().await?;
        self.session.activate();
        info!(model_tier = ?self.session.model_tier(), "Agent supervisor started");

        let kill = self.kill.clone();
        let join = tokio::spawn(self.run());
        Ok(SupervisorHandle { join, kill })
    }

    async fn run(mut self) -> AgentSession {
        loop {
            if self.exit_waiting() {
                info!(
                    abandoned = self.deferred.len(),
                    "Exit requested, stopping agent supervisor"
                );
                break;
            }

            let command = match self.deferred.pop_front() {
                Some(task) => SupervisorCommand::Run(task),
                None => match self.bus.next_command().await {
                    Some(command) => command,
                    None => {
                        info!("Protocol loop gone, stopping agent supervisor");
                        break;
                    }
                },
            };

            match command {
                SupervisorCommand::Run(task) => {
                    if let Flow::Exit = self.execute(task).await {
                        break;
                    }
                }
                SupervisorCommand::Exit => {
                    info!("Exit requested, stopping agent supervisor");
                    break;
                }
            }
        }

        while let Some(task) = self.deferred.pop_front() {
            let outcome = TurnOutcome::Failed("worker shutting down".to_string());
            publish_completion(&self.bus, &task, outcome).await;
        }

        if self.session.is_active() {
            self.backend.shutdown(self.shutdown_grace).await;
            self.session.deactivate();
        }
        info!(
            turns = self.session.turn_count(),
            session_id = ?self.session.session_id(),
            "Agent supervisor stopped"
        );
        self.session
    }

    /// Move waiting tasks to the deferred queue. True if an exit is among
    /// the waiting instructions, in which case no further task is started.
    fn exit_waiting(&mut self) -> bool {
        let mut exit = false;
        for command in self.bus.take_waiting() {
            match command {
                SupervisorCommand::Run(task) => self.deferred.push_back(task),
                SupervisorCommand::Exit => exit = true,
            }
        }
        exit
    }

    async fn execute(&mut self, task: TaskAssignment) -> Flow {
        if let Err(e) = self.ensure_running().await {
            error!(req_id = %task.req_id, error = %e, "Agent process unavailable");
            publish_completion(&self.bus, &task, TurnOutcome::Failed(e.to_string())).await;
            return self.flow();
        }

        info!(
            req_id = %task.req_id,
            prompt_len = task.prompt.len(),
            continuation = self.session.continuation(),
            "Starting task"
        );

        let request = self.session.request(task.prompt.clone());
        let observer = OutputObserver {
            req_id: task.req_id.clone(),
        };

        let result = {
            let turn = self.backend.turn(request, &observer);
            tokio::pin!(turn);
            loop {
                tokio::select! {
                    result = &mut turn => break Some(result),
                    command = self.bus.next_command() => match command {
                        Some(SupervisorCommand::Run(next)) => {
                            warn!(req_id = %next.req_id, "Task arrived mid-turn, deferring");
                            self.deferred.push_back(next);
                        }
                        Some(SupervisorCommand::Exit) | None => break None,
                    },
                }
            }
        };

        let Some(result) = result else {
            warn!(req_id = %task.req_id, "Exit requested mid-turn, killing agent process");
            self.kill.kill();
            let outcome = TurnOutcome::Failed("worker shutting down".to_string());
            publish_completion(&self.bus, &task, outcome).await;
            return Flow::Exit;
        };

        self.session.record(&result);
        if let Err(e) = &result {
            warn!(req_id = %task.req_id, error = %e, "Agent turn failed");
        }
        publish_completion(&self.bus, &task, TurnOutcome::classify(&result)).await;

        self.clear_context().await;
        self.flow()
    }

    /// Reset the conversation between tasks. Not interrupted by exit.
    async fn clear_context(&mut self) {
        if self.kill.was_killed() {
            return;
        }

        if !self.backend.is_running() {
            info!("Agent process lost, starting a fresh one");
            if let Err(e) = self.ensure_running().await {
                warn!(error = %e, "Failed to restart agent process");
            }
            return;
        }

        let request = self.session.request(CLEAR_COMMAND);
        match tokio::time::timeout(self.clear_timeout, self.backend.turn(request, &NullObserver))
            .await
        {
            Ok(result) => {
                self.session.record(&result);
                match TurnOutcome::classify(&result) {
                    TurnOutcome::Completed => {
                        debug!(turns = self.session.turn_count(), "Agent context cleared")
                    }
                    other => warn!(outcome = ?other, "Context clear did not succeed"),
                }
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.clear_timeout.as_secs(),
                    "Context clear timed out, restarting agent process"
                );
                self.backend.shutdown(Duration::ZERO).await;
            }
        }
    }

    async fn ensure_running(&mut self) -> Result<(), SdkError> {
        if self.backend.is_running() {
            return Ok(());
        }
        if self.kill.was_killed() {
            return Err(SdkError::NotRunning);
        }
        info!("Respawning agent process");
        self.backend.start().await?;
        self.session.activate();
        Ok(())
    }

    fn flow(&self) -> Flow {
        if self.kill.was_killed() {
            Flow::Exit
        } else {
            Flow::Continue
        }
    }
}

/// Log the outcome and publish its completion event.
async fn publish_completion(
    bus: &SupervisorEndpoint,
    task: &TaskAssignment,
    outcome: TurnOutcome,
) {
    let task_file = task.task_file_name();
    let kind = match outcome {
        TurnOutcome::Completed => {
            info!(req_id = %task.req_id, task_file = %task_file, "Task completed");
            json_output::emit_task_completed(&task_file);
            CompletionKind::Done
        }
        TurnOutcome::UsageLimited => {
            warn!(
                req_id = %task.req_id,
                task_file = %task_file,
                "Agent backend usage limit reached"
            );
            json_output::emit_usage_limited(&task_file);
            CompletionKind::UsageLimited
        }
        TurnOutcome::Failed(reason) => {
            warn!(req_id = %task.req_id, task_file = %task_file, reason = %reason, "Task failed");
            json_output::emit_task_failed(&task_file, &reason);
            CompletionKind::Failed
        }
    };

    if !bus.publish(CompletionEvent::new(kind, task)).await {
        warn!(task_file = %task_file, "Protocol loop gone, completion dropped");
    }
}

/// Surfaces the text of agent output, without envelope fields.
struct OutputObserver {
    req_id: RequestId,
}

impl TurnObserver for OutputObserver {
    fn on_message(&self, message: &ClaudeMessage) {
        trace!(req_id = %self.req_id, kind = message.kind(), "Agent message");
        for text in message.content_text() {
            info!(req_id = %self.req_id, "{}", text);
            json_output::emit_agent_output(self.req_id.as_str(), &text);
        }
    }
}

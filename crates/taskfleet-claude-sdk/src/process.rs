//! Long-lived Claude Code process in stream-json input/output mode.
//!
//! The process is spawned once and fed one user turn per line on stdin.
//! Each turn ends when Claude prints its `result` message.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, trace, warn};

use crate::error::SdkError;
use crate::protocol::{AgentBackend, TurnObserver, TurnRequest, TurnResult};
use crate::types::{ClaudeMessage, SdkUserMessage};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tools every session is allowed to use: fetch, read, write, shell.
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &["WebFetch", "Read", "Write", "Bash"];

/// Terminates the agent process immediately, from any task.
///
/// The handle is shared with the process owner. Once killed, any process
/// attached afterwards is killed on arrival.
#[derive(Debug, Clone, Default)]
pub struct KillHandle {
    inner: Arc<KillSlot>,
}

#[derive(Debug, Default)]
struct KillSlot {
    child: Mutex<Option<Child>>,
    killed: AtomicBool,
}

impl KillHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the attached process, if any. Never blocks.
    pub fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.lock().take() {
            match child.start_kill() {
                Ok(()) => info!(pid = ?child.id(), "Claude process killed"),
                Err(e) => warn!(error = %e, "Failed to kill Claude process"),
            }
        }
    }

    /// Returns true once [`kill`](Self::kill) has been called.
    pub fn was_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn attach(&self, mut child: Child) {
        if self.was_killed() {
            let _ = child.start_kill();
            return;
        }
        *self.lock() = Some(child);
    }

    pub(crate) fn detach(&self) -> Option<Child> {
        self.lock().take()
    }

    /// Poll the attached process without taking it. `None` when nothing
    /// is attached, including after [`kill`](Self::kill).
    pub(crate) fn try_wait(&self) -> Option<io::Result<Option<ExitStatus>>> {
        self.lock().as_mut().map(|child| child.try_wait())
    }

    /// Kill whatever process is attached without latching the handle.
    pub(crate) fn kill_attached(&self) {
        if let Some(mut child) = self.detach() {
            let _ = child.start_kill();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Child>> {
        self.inner
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pipes of a running process.
struct ProcessIo {
    stdin: ChildStdin,
    lines: LinesStream<BufReader<ChildStdout>>,
}

/// A Claude Code process bound to one working directory.
///
/// # Example
///
/// ```rust,no_run
/// use taskfleet_claude_sdk::{AgentBackend, ClaudeProcess, NullObserver, TurnRequest};
///
/// async fn run() -> Result<(), Box<dyn std::error::Error>> {
///     let mut process = ClaudeProcess::new("claude").with_working_dir("/srv/work");
///     process.start().await?;
///
///     let request = TurnRequest {
///         prompt: "What is 2 + 2?".to_string(),
///         continuation: false,
///         session_id: None,
///     };
///     let result = process.turn(request, &NullObserver).await?;
///     println!("Session: {:?}", result.session_id);
///     Ok(())
/// }
/// ```
pub struct ClaudeProcess {
    /// Path to the Claude CLI executable.
    claude_path: String,

    /// Directory the process runs in.
    working_dir: PathBuf,

    /// Model to use (optional).
    model: Option<String>,

    /// Tools the agent may use without asking.
    allowed_tools: Vec<String>,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,

    io: Option<ProcessIo>,
    kill: KillHandle,
}

impl ClaudeProcess {
    /// Create a new process description with the given path to the Claude CLI.
    ///
    /// The path can be just "claude" to use PATH lookup, or a full path.
    pub fn new(claude_path: impl Into<String>) -> Self {
        Self {
            claude_path: claude_path.into(),
            working_dir: PathBuf::from("."),
            model: None,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect(),
            env_vars: Vec::new(),
            io: None,
            kill: KillHandle::new(),
        }
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.claude_path);

        cmd.arg("--print")
            .arg("--verbose")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json");

        if !self.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(self.allowed_tools.join(","));
        }

        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.working_dir)
            .kill_on_drop(true);

        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        cmd
    }

    async fn run_turn(
        io: &mut ProcessIo,
        request: TurnRequest,
        observer: &dyn TurnObserver,
    ) -> Result<TurnResult, SdkError> {
        let turn_id = uuid::Uuid::new_v4();
        let line = serde_json::to_string(&SdkUserMessage::new(
            request.prompt.as_str(),
            request.wire_session_id(),
        ))?;

        info!(
            turn_id = %turn_id,
            prompt_len = request.prompt.len(),
            continuation = request.continuation,
            "Sending turn to Claude"
        );
        trace!("Sending to stdin: {}", line);

        io.stdin.write_all(line.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;

        let mut session_id = request.session_id;
        let mut message_count = 0u64;

        while let Some(line) = io.lines.next().await {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            message_count += 1;

            let message = match serde_json::from_str::<ClaudeMessage>(trimmed) {
                Ok(message) => message,
                Err(e) => {
                    let preview: String = trimmed.chars().take(200).collect();
                    warn!(error = %e, preview = %preview, "Failed to parse Claude message");
                    continue;
                }
            };

            debug!(turn_id = %turn_id, message_num = message_count, message_type = message.kind(), "Received message from Claude");

            if let Some(sid) = message.session_id() {
                session_id = Some(sid.to_string());
            }
            observer.on_message(&message);

            if let ClaudeMessage::Result {
                subtype,
                is_error,
                duration_ms,
                result,
                error,
                ..
            } = message
            {
                info!(
                    turn_id = %turn_id,
                    is_error = ?is_error,
                    duration_ms = ?duration_ms,
                    "Turn finished"
                );
                return Ok(TurnResult {
                    session_id,
                    subtype,
                    is_error: is_error.unwrap_or(false),
                    result: result.map(|value| match value {
                        serde_json::Value::String(text) => text,
                        other => other.to_string(),
                    }),
                    error,
                    duration_ms,
                });
            }
        }

        info!(turn_id = %turn_id, total_messages = message_count, "Claude stdout closed (EOF)");
        Err(SdkError::ProcessExited)
    }
}

impl Default for ClaudeProcess {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[async_trait]
impl AgentBackend for ClaudeProcess {
    async fn start(&mut self) -> Result<(), SdkError> {
        if self.io.is_some() {
            return Ok(());
        }

        info!(
            claude_path = %self.claude_path,
            working_dir = %self.working_dir.display(),
            model = ?self.model,
            allowed_tools = ?self.allowed_tools,
            "Spawning Claude process"
        );

        let mut child = self.command().spawn().map_err(|e| {
            error!(error = %e, "Failed to spawn Claude process");
            if e.kind() == std::io::ErrorKind::NotFound {
                SdkError::ClaudeNotFound(self.claude_path.clone())
            } else {
                SdkError::SpawnError(e)
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SdkError::ProtocolError("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SdkError::ProtocolError("Failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SdkError::ProtocolError("Failed to get stderr".to_string()))?;

        info!(pid = ?child.id(), "Claude process spawned");

        // Spawn stderr reader for logging
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            warn!(stderr = %trimmed, "Claude stderr");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Error reading Claude stderr");
                        break;
                    }
                }
            }
        });

        self.kill.attach(child);
        self.io = Some(ProcessIo {
            stdin,
            lines: LinesStream::new(BufReader::new(stdout).lines()),
        });
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.io.is_some()
    }

    async fn turn(
        &mut self,
        request: TurnRequest,
        observer: &dyn TurnObserver,
    ) -> Result<TurnResult, SdkError> {
        let io = self.io.as_mut().ok_or(SdkError::NotRunning)?;
        let result = Self::run_turn(io, request, observer).await;

        if let Err(e) = &result {
            if e.is_fatal_to_process() {
                warn!(error = %e, "Claude process lost, dropping session");
                self.io = None;
                self.kill.kill_attached();
            }
        }
        result
    }

    fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    async fn shutdown(&mut self, grace: Duration) {
        // Closing stdin ends a --print session once the current turn is done.
        self.io = None;

        // The child stays in the kill slot while we wait, so a kill from
        // another task still reaches it.
        let deadline = Instant::now() + grace;
        loop {
            match self.kill.try_wait() {
                None => return,
                Some(Ok(Some(status))) => {
                    self.kill.detach();
                    info!(exit_code = ?status.code(), "Claude process exited");
                    return;
                }
                Some(Ok(None)) if Instant::now() >= deadline => {
                    warn!(grace_secs = grace.as_secs(), "Claude process did not exit, killing");
                    self.kill.kill_attached();
                    return;
                }
                Some(Ok(None)) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                Some(Err(e)) => {
                    warn!(error = %e, "Failed waiting for Claude process");
                    self.kill.kill_attached();
                    return;
                }
            }
        }
    }
}

//! Test doubles shared by the worker's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use taskfleet_claude_sdk::{
    AgentBackend, ClaudeMessage, KillHandle, SdkError, TurnObserver, TurnRequest, TurnResult,
};
use tokio::time::Instant;

pub const FAKE_SESSION: &str = "fake-session";

/// How the fake agent answers one prompt.
#[derive(Debug, Clone)]
pub enum ReplyKind {
    Success,
    UsageLimit,
    Error,
    Crash,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub kind: ReplyKind,
    pub delay: Duration,
}

impl Reply {
    pub fn new(kind: ReplyKind) -> Self {
        Self {
            kind,
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for Reply {
    fn default() -> Self {
        Self::new(ReplyKind::Success)
    }
}

/// One turn as the fake agent saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRecord {
    pub prompt: String,
    pub continuation: bool,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TurnLog(Arc<Mutex<Vec<TurnRecord>>>);

impl TurnLog {
    pub fn records(&self) -> Vec<TurnRecord> {
        self.0.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.prompt).collect()
    }

    fn push(&self, record: TurnRecord) {
        self.0.lock().unwrap().push(record);
    }
}

/// An [`AgentBackend`] that answers from a script instead of running Claude.
pub struct ScriptedBackend {
    replies: HashMap<String, Reply>,
    log: TurnLog,
    starts: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
    fail_start: bool,
    running: bool,
    kill: KillHandle,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            log: TurnLog::default(),
            starts: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            fail_start: false,
            running: false,
            kill: KillHandle::new(),
        }
    }

    pub fn reply(mut self, prompt: &str, reply: Reply) -> Self {
        self.replies.insert(prompt.to_string(), reply);
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn log(&self) -> TurnLog {
        self.log.clone()
    }

    pub fn starts(&self) -> Arc<AtomicUsize> {
        self.starts.clone()
    }

    pub fn shutdowns(&self) -> Arc<AtomicUsize> {
        self.shutdowns.clone()
    }

    fn text_message(text: &str) -> ClaudeMessage {
        serde_json::from_value(serde_json::json!({
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": [{ "type": "text", "text": text }]
            },
            "session_id": FAKE_SESSION
        }))
        .unwrap()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn start(&mut self) -> Result<(), SdkError> {
        if self.fail_start {
            return Err(SdkError::ClaudeNotFound("fake-claude".to_string()));
        }
        self.running = true;
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running && !self.kill.was_killed()
    }

    async fn turn(
        &mut self,
        request: TurnRequest,
        observer: &dyn TurnObserver,
    ) -> Result<TurnResult, SdkError> {
        if !self.is_running() {
            return Err(SdkError::NotRunning);
        }

        self.log.push(TurnRecord {
            prompt: request.prompt.clone(),
            continuation: request.continuation,
            session_id: request.wire_session_id(),
        });
        let reply = self.replies.get(&request.prompt).cloned().unwrap_or_default();

        let deadline = Instant::now() + reply.delay;
        loop {
            if self.kill.was_killed() {
                self.running = false;
                return Err(SdkError::ProcessExited);
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        observer.on_message(&Self::text_message("working on it"));

        match reply.kind {
            ReplyKind::Success => Ok(TurnResult {
                session_id: Some(FAKE_SESSION.to_string()),
                subtype: Some("success".to_string()),
                result: Some("done".to_string()),
                ..Default::default()
            }),
            ReplyKind::UsageLimit => Ok(TurnResult {
                session_id: Some(FAKE_SESSION.to_string()),
                subtype: Some("success".to_string()),
                is_error: true,
                result: Some("Claude AI usage limit reached|1760000000".to_string()),
                ..Default::default()
            }),
            ReplyKind::Error => Ok(TurnResult {
                session_id: Some(FAKE_SESSION.to_string()),
                subtype: Some("error_during_execution".to_string()),
                is_error: true,
                ..Default::default()
            }),
            ReplyKind::Crash => {
                self.running = false;
                Err(SdkError::ProcessExited)
            }
        }
    }

    fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    async fn shutdown(&mut self, _grace: Duration) {
        self.running = false;
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

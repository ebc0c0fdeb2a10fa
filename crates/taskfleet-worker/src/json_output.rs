//! JSON event lines on stdout, for supervising tools.
//!
//! Disabled unless `--json` is given; logs always go to stderr.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

static ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable_json_mode() {
    ENABLED.store(true, Ordering::Relaxed);
}

pub fn is_json_mode() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Event names as they appear in the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonEventType {
    WorkerJoined,
    TaskAccepted,
    AgentOutput,
    TaskCompleted,
    TaskFailed,
    UsageLimited,
    WorkerLeft,
    Error,
}

/// One stdout line: `{"event": ..., "timestamp": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent {
    pub event: JsonEventType,
    #[serde(serialize_with = "rfc3339")]
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

fn rfc3339<S: serde::Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl JsonEvent {
    pub fn new(event: JsonEventType, data: Value) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Write the event if JSON mode is on. Output errors are ignored.
    pub fn emit(&self) {
        if !is_json_mode() {
            return;
        }
        let Ok(line) = serde_json::to_string(self) else {
            return;
        };
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}", line).and_then(|()| out.flush());
    }
}

fn emit(event: JsonEventType, data: Value) {
    if is_json_mode() {
        JsonEvent::new(event, data).emit();
    }
}

pub fn emit_worker_joined(worker_id: &str, coordinator: &str) {
    emit(
        JsonEventType::WorkerJoined,
        json!({
            "worker_id": worker_id,
            "coordinator": coordinator,
        }),
    );
}

pub fn emit_task_accepted(req_id: &str, queued: usize) {
    emit(
        JsonEventType::TaskAccepted,
        json!({
            "req_id": req_id,
            "queued": queued,
        }),
    );
}

/// Emit one line of agent output for the task `req_id`.
pub fn emit_agent_output(req_id: &str, content: &str) {
    emit(
        JsonEventType::AgentOutput,
        json!({
            "req_id": req_id,
            "content": content,
        }),
    );
}

pub fn emit_task_completed(task_file: &str) {
    emit(JsonEventType::TaskCompleted, json!({ "task_file": task_file }));
}

pub fn emit_task_failed(task_file: &str, error: &str) {
    emit(
        JsonEventType::TaskFailed,
        json!({
            "task_file": task_file,
            "error": error,
        }),
    );
}

pub fn emit_usage_limited(task_file: &str) {
    emit(JsonEventType::UsageLimited, json!({ "task_file": task_file }));
}

/// Emit a worker_left event with the shutdown reason.
pub fn emit_worker_left(worker_id: Option<&str>, reason: &str, forced: bool) {
    emit(
        JsonEventType::WorkerLeft,
        json!({
            "worker_id": worker_id,
            "reason": reason,
            "forced": forced,
        }),
    );
}

/// Emit an error event.
pub fn emit_error(message: &str) {
    emit(JsonEventType::Error, json!({ "message": message }));
}

//! Task assignments and their completion events.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{RequestId, WorkerId};
use crate::message::Message;

/// A task handed from the protocol loop to the agent supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Request id of the REQUEST this task came from.
    pub req_id: RequestId,
    /// Prompt text, forwarded to the agent untouched.
    pub prompt: String,
}

impl TaskAssignment {
    /// Create a new TaskAssignment.
    pub fn new(req_id: RequestId, prompt: impl Into<String>) -> Self {
        Self {
            req_id,
            prompt: prompt.into(),
        }
    }

    /// Name the coordinator knows this task by in completion reports.
    pub fn task_file_name(&self) -> String {
        format!("task_{}", self.req_id)
    }
}

impl TryFrom<Message> for TaskAssignment {
    type Error = CoreError;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        match message {
            Message::Request { msg, req_id } => Ok(Self::new(req_id, msg)),
            other => Err(CoreError::NotATaskRequest(other.kind().to_string())),
        }
    }
}

/// Terminal outcome of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionKind {
    /// The agent finished the task.
    Done,
    /// The agent errored, crashed or ended in a malformed state.
    Failed,
    /// The agent backend reported quota exhaustion.
    UsageLimited,
}

/// Produced exactly once per [`TaskAssignment`] by the agent supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub kind: CompletionKind,
    /// Task file name of the originating assignment.
    pub task_file: String,
}

impl CompletionEvent {
    /// Create a completion event for `task`.
    pub fn new(kind: CompletionKind, task: &TaskAssignment) -> Self {
        Self {
            kind,
            task_file: task.task_file_name(),
        }
    }

    /// Translate into the report sent to the coordinator.
    ///
    /// USAGE_LIMITED identifies the worker rather than the task.
    pub fn into_report(self, worker_id: &WorkerId) -> Message {
        match self.kind {
            CompletionKind::Done => Message::Done {
                msg: self.task_file,
            },
            CompletionKind::Failed => Message::Failed {
                msg: self.task_file,
            },
            CompletionKind::UsageLimited => Message::UsageLimited {
                msg: worker_id.as_str().to_string(),
            },
        }
    }
}

//! Claude Code agent session for TaskFleet
//!
//! This crate drives one long-lived Claude Code subprocess in stream-json
//! mode, one turn at a time, and checks at startup that the backend is
//! installed and logged in.
//!
//! # Example
//!
//! ```rust,no_run
//! use taskfleet_claude_sdk::{AgentBackend, ClaudeProcess, NullObserver, TurnOutcome, TurnRequest};
//!
//! async fn run_agent() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut process = ClaudeProcess::new("claude").with_working_dir("/srv/work");
//!     process.start().await?;
//!
//!     let request = TurnRequest {
//!         prompt: "What is 2 + 2?".to_string(),
//!         continuation: false,
//!         session_id: None,
//!     };
//!     let result = process.turn(request, &NullObserver).await;
//!     println!("Outcome: {:?}", TurnOutcome::classify(&result));
//!     Ok(())
//! }
//! ```

mod error;
mod preflight;
mod process;
mod protocol;
mod types;

// Re-export main types
pub use error::SdkError;
pub use preflight::{
    check_authenticated, check_installed, detect_api_key_credential, ClaudePaths, Preflight,
    PreflightError, API_KEY_ENV_VARS,
};
pub use process::{ClaudeProcess, KillHandle, DEFAULT_ALLOWED_TOOLS};
pub use protocol::{AgentBackend, NullObserver, TurnObserver, TurnOutcome, TurnRequest, TurnResult};
pub use types::{
    AssistantMessage, ClaudeMessage, ContentDelta, ContentItem, MessageDelta, OutgoingUserMessage,
    SdkUserMessage, StreamEvent, UserMessage,
};

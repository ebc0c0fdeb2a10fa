//! TaskFleet Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network sockets
//! - Subprocesses
//! - Runtime specifics
//!
//! All types here describe what a fleet worker exchanges with its
//! coordinator and with its own agent supervisor.

pub mod error;
pub mod ids;
pub mod message;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{RequestId, WorkerId};
pub use message::Message;
pub use status::{ConnectionState, ModelTier};
pub use task::{CompletionEvent, CompletionKind, TaskAssignment};

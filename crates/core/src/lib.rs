//! # Ratchet Core
//!
//! Domain types, traits, and error definitions for the ratchet agent loop.
//! This crate does **no I/O** — it defines the domain model that all other
//! crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the loop is defined as a trait here. Implementations
//! live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod state;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ModelError, Result, StoreError, ToolError, ToolFailureKind};
pub use event::{AgentEvent, EventBus};
pub use message::{ConversationId, EncodedBody, Message, MessageBody, Role};
pub use provider::{ModelReply, ModelRequest, ModelResponse, Provider, ToolDefinition, Usage};
pub use state::{ControlState, pending_calls};
pub use store::{Checkpoint, CheckpointId, ConversationSummary, LogCursor, MessageStore};
pub use tool::{
    RegisteredTool, Tool, ToolCallRequest, ToolHandle, ToolOutcome, ToolOutput, ToolRegistry,
    ToolResult, ToolServer,
};

//! The ratchet agent loop.
//!
//! An [`AgentLoop`] drives one conversation through
//! user input → model → tool calls → tool results → model → answer,
//! checkpointing after every append so it can be reopened mid-turn.

pub mod cancel;
pub mod loop_runner;
pub mod prompt;

pub use cancel::{CancelHandle, CancelLevel};
pub use loop_runner::{
    AgentLoop, CANCELLED_NOTICE, LoopBuilder, LoopSettings, MAX_ROUNDS_NOTICE, TurnOutcome,
};
pub use prompt::{DEFAULT_SYSTEM_PROMPT, system_prompt};

//! Error types for the ratchet domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; they fold into [`Error`]
//! at the loop boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all ratchet operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model service errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Persistence errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Tool errors (only surface outside the dispatcher during setup) ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Loop control ---
    #[error("Operation not allowed while {state}: {reason}")]
    InvalidState { state: String, reason: String },

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures raised by the model service boundary.
///
/// Network failures and malformed responses are the only kinds the gateway
/// raises; the rest describe why a request could not be attempted.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("Model service unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limited by model service, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Model request timed out: {0}")]
    Timeout(String),

    #[error("Malformed model response: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model provider not configured: {0}")]
    NotConfigured(String),
}

impl ModelError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited { .. } | Self::Timeout(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool timed out: {tool_name} after {timeout:?}")]
    Timeout {
        tool_name: String,
        timeout: std::time::Duration,
    },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool server '{server}' unreachable: {reason}")]
    Unreachable { server: String, reason: String },

    #[error("Tool call cancelled: {0}")]
    Cancelled(String),
}

impl ToolError {
    /// The failure kind recorded in the conversation for this error.
    pub fn kind(&self) -> ToolFailureKind {
        match self {
            Self::Timeout { .. } => ToolFailureKind::Timeout,
            Self::Unreachable { .. } => ToolFailureKind::Unreachable,
            Self::Cancelled(_) => ToolFailureKind::Cancelled,
            Self::NotFound(_) | Self::InvalidArguments(_) | Self::ExecutionFailed { .. } => {
                ToolFailureKind::ExecutionError
            }
        }
    }
}

/// The typed failure carried by a failed tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    Timeout,
    ExecutionError,
    Unreachable,
    Cancelled,
}

impl std::fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::ExecutionError => "execution_error",
            Self::Unreachable => "unreachable",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conflict in {conversation_id}: call '{call_id}' already recorded")]
    Conflict {
        conversation_id: String,
        call_id: String,
    },

    #[error("Unknown call '{call_id}' in {conversation_id}: no prior tool_call")]
    UnknownCall {
        conversation_id: String,
        call_id: String,
    },

    #[error("Stale checkpoint for {conversation_id} at sequence {sequence}: {reason}")]
    StaleCheckpoint {
        conversation_id: String,
        sequence: u64,
        reason: String,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

impl StoreError {
    /// Conflicts are recoverable (the first write stands); everything else halts the loop.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

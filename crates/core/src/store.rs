//! MessageStore trait — durable, append-only conversation logs with checkpoints.
//!
//! The store owns physical durability. It enforces the log invariants that do
//! not depend on loop logic:
//! - sequences are assigned at append time, starting at 1, without gaps
//! - a `tool_result` must reference a prior `tool_call` of the same conversation
//! - at most one `tool_call` and at most one `tool_result` per `call_id`
//! - checkpoints only move forward and never point past the end of the log
//!
//! Implementations: SQLite (durable), in-memory (for testing).

use crate::error::StoreError;
use crate::message::{ConversationId, Message, MessageBody};
use crate::state::ControlState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Identifies a checkpoint: `(conversation_id, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId {
    pub conversation_id: ConversationId,
    pub sequence: u64,
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.conversation_id, self.sequence)
    }
}

/// A snapshot of a conversation: every message up to and including
/// `sequence`, plus the control state recorded with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub conversation_id: ConversationId,
    pub sequence: u64,
    pub state: ControlState,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn id(&self) -> CheckpointId {
        CheckpointId {
            conversation_id: self.conversation_id.clone(),
            sequence: self.sequence,
        }
    }
}

/// One row of `list_conversations()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub message_count: u64,
    pub last_sequence: u64,
    /// State recorded by the most recent checkpoint, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_state: Option<ControlState>,
}

/// The core MessageStore trait.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Append a message and return its sequence.
    ///
    /// Returns only after the write is durable. Fails with
    /// [`StoreError::Conflict`] on a duplicate `call_id` and with
    /// [`StoreError::UnknownCall`] for a result that has no prior call.
    async fn append(
        &self,
        conversation_id: &ConversationId,
        body: MessageBody,
    ) -> Result<u64, StoreError>;

    /// Up to `limit` messages with `sequence >= from_sequence`, ascending.
    async fn read_range(
        &self,
        conversation_id: &ConversationId,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Highest sequence in the conversation, 0 when empty.
    async fn last_sequence(&self, conversation_id: &ConversationId) -> Result<u64, StoreError>;

    /// Record that the conversation was in `state` after message `sequence`.
    ///
    /// Fails with [`StoreError::StaleCheckpoint`] unless `sequence` is
    /// strictly after the latest checkpoint and not past the end of the log.
    async fn checkpoint(
        &self,
        conversation_id: &ConversationId,
        sequence: u64,
        state: ControlState,
    ) -> Result<CheckpointId, StoreError>;

    /// The highest-sequence checkpoint, with its message list.
    async fn latest_checkpoint(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// The highest checkpoint whose sequence is `<= sequence`.
    async fn checkpoint_at_or_before(
        &self,
        conversation_id: &ConversationId,
        sequence: u64,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Keep the `keep` most recent checkpoints and delete the rest.
    ///
    /// The latest checkpoint always survives, even with `keep == 0`.
    /// Returns how many were removed.
    async fn prune_checkpoints(
        &self,
        conversation_id: &ConversationId,
        keep: usize,
    ) -> Result<usize, StoreError>;

    /// All conversations that have at least one message, ordered by id.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError>;

    /// Every message of the conversation, read page by page.
    async fn read_all(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        self.read_from(conversation_id, 1).await
    }

    /// Every message with `sequence >= from_sequence`.
    async fn read_from(
        &self,
        conversation_id: &ConversationId,
        from_sequence: u64,
    ) -> Result<Vec<Message>, StoreError> {
        let mut out = Vec::new();
        let mut next = from_sequence.max(1);
        loop {
            let page = self
                .read_range(conversation_id, next, LogCursor::DEFAULT_PAGE_SIZE)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            next = last.sequence + 1;
            let short = page.len() < LogCursor::DEFAULT_PAGE_SIZE;
            out.extend(page);
            if short {
                break;
            }
        }
        Ok(out)
    }
}

/// A lazy, restartable reader over one conversation's log.
///
/// Pulls pages from the store on demand. [`LogCursor::position`] is the next
/// sequence to be returned; a new cursor started there continues where this
/// one left off.
pub struct LogCursor<'a> {
    store: &'a dyn MessageStore,
    conversation_id: ConversationId,
    next_sequence: u64,
    page_size: usize,
    buffer: VecDeque<Message>,
    exhausted: bool,
}

impl<'a> LogCursor<'a> {
    pub const DEFAULT_PAGE_SIZE: usize = 256;

    pub fn new(
        store: &'a dyn MessageStore,
        conversation_id: ConversationId,
        from_sequence: u64,
    ) -> Self {
        Self {
            store,
            conversation_id,
            next_sequence: from_sequence.max(1),
            page_size: Self::DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The next sequence this cursor will yield.
    pub fn position(&self) -> u64 {
        self.next_sequence
    }

    /// The next message, or `None` at the current end of the log.
    pub async fn next(&mut self) -> Result<Option<Message>, StoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .read_range(&self.conversation_id, self.next_sequence, self.page_size)
                .await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            self.buffer.extend(page);
        }

        let message = self.buffer.pop_front();
        if let Some(m) = &message {
            self.next_sequence = m.sequence + 1;
        }
        Ok(message)
    }

    /// Drain the rest of the log.
    pub async fn collect(mut self) -> Result<Vec<Message>, StoreError> {
        let mut out = Vec::new();
        while let Some(message) = self.next().await? {
            out.push(message);
        }
        Ok(out)
    }
}

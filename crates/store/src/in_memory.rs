//! In-memory store — useful for testing and ephemeral sessions.
//!
//! Enforces the same log invariants as the SQLite store but keeps nothing
//! across process restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ratchet_core::error::StoreError;
use ratchet_core::message::{ConversationId, Message, MessageBody};
use ratchet_core::state::ControlState;
use ratchet_core::store::{Checkpoint, CheckpointId, ConversationSummary, MessageStore};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct ConversationLog {
    messages: Vec<Message>,
    checkpoints: Vec<(u64, ControlState, DateTime<Utc>)>,
    call_ids: HashSet<String>,
    result_ids: HashSet<String>,
}

impl ConversationLog {
    fn snapshot(
        &self,
        conversation_id: &ConversationId,
        entry: &(u64, ControlState, DateTime<Utc>),
    ) -> Checkpoint {
        let (sequence, state, created_at) = *entry;
        Checkpoint {
            conversation_id: conversation_id.clone(),
            sequence,
            state,
            messages: self
                .messages
                .iter()
                .take_while(|m| m.sequence <= sequence)
                .cloned()
                .collect(),
            created_at,
        }
    }
}

/// An in-memory store keyed by conversation.
pub struct InMemoryStore {
    conversations: Arc<RwLock<BTreeMap<ConversationId, ConversationLog>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            conversations: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(
        &self,
        conversation_id: &ConversationId,
        body: MessageBody,
    ) -> Result<u64, StoreError> {
        let mut conversations = self.conversations.write().await;
        let log = conversations.entry(conversation_id.clone()).or_default();

        match &body {
            MessageBody::ToolCall { call_id, .. } if log.call_ids.contains(call_id) => {
                return Err(StoreError::Conflict {
                    conversation_id: conversation_id.to_string(),
                    call_id: call_id.clone(),
                });
            }
            MessageBody::ToolResult { call_id, .. } => {
                if !log.call_ids.contains(call_id) {
                    return Err(StoreError::UnknownCall {
                        conversation_id: conversation_id.to_string(),
                        call_id: call_id.clone(),
                    });
                }
                if log.result_ids.contains(call_id) {
                    return Err(StoreError::Conflict {
                        conversation_id: conversation_id.to_string(),
                        call_id: call_id.clone(),
                    });
                }
            }
            _ => {}
        }

        match &body {
            MessageBody::ToolCall { call_id, .. } => {
                log.call_ids.insert(call_id.clone());
            }
            MessageBody::ToolResult { call_id, .. } => {
                log.result_ids.insert(call_id.clone());
            }
            _ => {}
        }

        let sequence = log.messages.len() as u64 + 1;
        log.messages.push(Message::new(sequence, body));
        Ok(sequence)
    }

    async fn read_range(
        &self,
        conversation_id: &ConversationId,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conversations = self.conversations.read().await;
        let Some(log) = conversations.get(conversation_id) else {
            return Ok(Vec::new());
        };
        // Sequences start at 1 with no gaps, so the index is sequence - 1.
        let start = from_sequence.max(1) as usize - 1;
        Ok(log.messages.iter().skip(start).take(limit).cloned().collect())
    }

    async fn last_sequence(&self, conversation_id: &ConversationId) -> Result<u64, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .map(|log| log.messages.len() as u64)
            .unwrap_or(0))
    }

    async fn checkpoint(
        &self,
        conversation_id: &ConversationId,
        sequence: u64,
        state: ControlState,
    ) -> Result<CheckpointId, StoreError> {
        let mut conversations = self.conversations.write().await;
        let log = conversations.entry(conversation_id.clone()).or_default();

        let stale = |reason: String| StoreError::StaleCheckpoint {
            conversation_id: conversation_id.to_string(),
            sequence,
            reason,
        };

        let last = log.messages.len() as u64;
        if sequence == 0 || sequence > last {
            return Err(stale(format!("log ends at sequence {last}")));
        }
        if let Some((latest, _, _)) = log.checkpoints.last()
            && sequence <= *latest
        {
            return Err(stale(format!("latest checkpoint is at {latest}")));
        }

        log.checkpoints.push((sequence, state, Utc::now()));
        Ok(CheckpointId {
            conversation_id: conversation_id.clone(),
            sequence,
        })
    }

    async fn latest_checkpoint(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(conversation_id).and_then(|log| {
            log.checkpoints
                .last()
                .map(|entry| log.snapshot(conversation_id, entry))
        }))
    }

    async fn checkpoint_at_or_before(
        &self,
        conversation_id: &ConversationId,
        sequence: u64,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(conversation_id).and_then(|log| {
            log.checkpoints
                .iter()
                .rev()
                .find(|(seq, _, _)| *seq <= sequence)
                .map(|entry| log.snapshot(conversation_id, entry))
        }))
    }

    async fn prune_checkpoints(
        &self,
        conversation_id: &ConversationId,
        keep: usize,
    ) -> Result<usize, StoreError> {
        let mut conversations = self.conversations.write().await;
        let Some(log) = conversations.get_mut(conversation_id) else {
            return Ok(0);
        };
        let keep = keep.max(1);
        let excess = log.checkpoints.len().saturating_sub(keep);
        log.checkpoints.drain(..excess);
        Ok(excess)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .iter()
            .filter(|(_, log)| !log.messages.is_empty())
            .map(|(id, log)| ConversationSummary {
                conversation_id: id.clone(),
                message_count: log.messages.len() as u64,
                last_sequence: log.messages.len() as u64,
                checkpoint_state: log.checkpoints.last().map(|(_, state, _)| *state),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_core::tool::{ToolCallRequest, ToolOutput, ToolResult};

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "list_dir", serde_json::json!({"path": "/tmp"}))
    }

    fn result(id: &str, output: &str) -> MessageBody {
        MessageBody::tool_result(ToolResult::success(&call(id), ToolOutput::text(output)))
    }

    #[tokio::test]
    async fn sequences_are_assigned_in_order() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("c1");
        assert_eq!(store.append(&id, MessageBody::user("a")).await.unwrap(), 1);
        assert_eq!(store.append(&id, MessageBody::assistant("b")).await.unwrap(), 2);
        assert_eq!(store.last_sequence(&id).await.unwrap(), 2);

        let other = ConversationId::from("c2");
        assert_eq!(store.append(&other, MessageBody::user("x")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_result_is_rejected_and_first_stands() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("c1");
        store.append(&id, MessageBody::user("go")).await.unwrap();
        store
            .append(&id, MessageBody::tool_call(&call("call_1")))
            .await
            .unwrap();
        store.append(&id, result("call_1", "first")).await.unwrap();

        let err = store.append(&id, result("call_1", "second")).await.unwrap_err();
        assert!(err.is_conflict());

        let messages = store.read_all(&id).await.unwrap();
        assert_eq!(messages.len(), 3);
        match &messages[2].body {
            MessageBody::ToolResult { outcome, .. } => {
                assert!(serde_json::to_string(outcome).unwrap().contains("first"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn result_without_call_is_unknown() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("c1");
        let err = store.append(&id, result("ghost", "x")).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownCall { .. }));
        assert_eq!(store.last_sequence(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_call_id_is_conflict() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("c1");
        store
            .append(&id, MessageBody::tool_call(&call("call_1")))
            .await
            .unwrap();
        let err = store
            .append(&id, MessageBody::tool_call(&call("call_1")))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn checkpoints_are_monotonic_and_bounded() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("c1");
        store.append(&id, MessageBody::user("a")).await.unwrap();
        store.append(&id, MessageBody::assistant("b")).await.unwrap();

        store
            .checkpoint(&id, 1, ControlState::AwaitingModelResponse)
            .await
            .unwrap();
        assert!(matches!(
            store.checkpoint(&id, 1, ControlState::AwaitingModelResponse).await,
            Err(StoreError::StaleCheckpoint { .. })
        ));
        assert!(matches!(
            store.checkpoint(&id, 3, ControlState::AwaitingUserInput).await,
            Err(StoreError::StaleCheckpoint { .. })
        ));
        store
            .checkpoint(&id, 2, ControlState::AwaitingUserInput)
            .await
            .unwrap();

        let latest = store.latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.messages.len(), 2);

        let earlier = store.checkpoint_at_or_before(&id, 1).await.unwrap().unwrap();
        assert_eq!(earlier.state, ControlState::AwaitingModelResponse);
        assert_eq!(earlier.messages.len(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_latest() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("c1");
        for i in 1..=4u64 {
            store.append(&id, MessageBody::user(format!("m{i}"))).await.unwrap();
            store
                .checkpoint(&id, i, ControlState::AwaitingModelResponse)
                .await
                .unwrap();
        }
        assert_eq!(store.prune_checkpoints(&id, 0).await.unwrap(), 3);
        assert_eq!(store.latest_checkpoint(&id).await.unwrap().unwrap().sequence, 4);
        assert!(store.checkpoint_at_or_before(&id, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_conversations_summarizes() {
        let store = InMemoryStore::new();
        let a = ConversationId::from("a");
        let b = ConversationId::from("b");
        store.append(&b, MessageBody::user("x")).await.unwrap();
        store.append(&a, MessageBody::user("y")).await.unwrap();
        store.append(&a, MessageBody::assistant("z")).await.unwrap();
        store
            .checkpoint(&a, 2, ControlState::AwaitingUserInput)
            .await
            .unwrap();

        let list = store.list_conversations().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].conversation_id, a);
        assert_eq!(list[0].message_count, 2);
        assert_eq!(list[0].checkpoint_state, Some(ControlState::AwaitingUserInput));
        assert!(list[1].checkpoint_state.is_none());
    }

    #[tokio::test]
    async fn read_range_honors_bounds() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("c1");
        for i in 0..5 {
            store.append(&id, MessageBody::user(format!("m{i}"))).await.unwrap();
        }
        let page = store.read_range(&id, 2, 2).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(store.read_range(&id, 9, 10).await.unwrap().is_empty());
        assert!(store
            .read_range(&ConversationId::from("none"), 1, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
